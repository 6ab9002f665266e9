//! Provides the immutable byte wrapper handed out for cached values.
//!
//! Cached values are shared: the same bytes live in the cache and in the hands of every caller
//! which received them. A [ByteView](ByteView) therefore never exposes its underlying buffer
//! mutably - accessors either return an independent copy or a read-only view. This guarantees
//! that no caller can corrupt the cache by scribbling over a value it was handed.
use crate::lru::ByteSize;
use bytes::Bytes;
use std::fmt::{Display, Formatter};

/// An immutable view of a cached value.
///
/// Cloning a view is cheap (it only bumps a reference counter), which is what allows the cache
/// to hand the same value to many callers without copying it per request.
///
/// # Examples
/// ```
/// # use callisto::view::ByteView;
/// let view = ByteView::from(b"630".to_vec());
/// assert_eq!(view.len(), 3);
/// assert_eq!(view.to_vec(), b"630");
/// assert_eq!(format!("{}", view), "630");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByteView {
    data: Bytes,
}

impl ByteView {
    /// Returns the length of the underlying bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Determines if the view is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns an independent copy of the underlying bytes.
    ///
    /// Mutating the returned vector has no effect on the cached value.
    ///
    /// # Examples
    /// ```
    /// # use callisto::view::ByteView;
    /// let view = ByteView::from(b"630".to_vec());
    ///
    /// let mut copy = view.to_vec();
    /// copy[0] = b'X';
    ///
    /// // The view itself is unharmed...
    /// assert_eq!(view.to_vec(), b"630");
    /// ```
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    /// Grants read-only access to the underlying bytes without copying them.
    ///
    /// This is used on the hot paths (writing a value onto the wire) where a defensive copy
    /// per request would be wasted work.
    pub fn as_slice(&self) -> &[u8] {
        self.data.as_ref()
    }
}

impl From<Vec<u8>> for ByteView {
    fn from(data: Vec<u8>) -> Self {
        ByteView { data: data.into() }
    }
}

impl From<&[u8]> for ByteView {
    fn from(data: &[u8]) -> Self {
        ByteView {
            data: Bytes::copy_from_slice(data),
        }
    }
}

impl Display for ByteView {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.data))
    }
}

impl ByteSize for ByteView {
    fn allocated_size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::view::ByteView;

    #[test]
    fn copies_are_isolated_from_the_view() {
        let view = ByteView::from(b"immutable".as_slice());
        let clone = view.clone();

        let mut copy = view.to_vec();
        copy.iter_mut().for_each(|byte| *byte = b'X');

        // Neither the view itself nor any of its clones observe the mutation...
        assert_eq!(view.to_vec(), b"immutable");
        assert_eq!(clone.to_vec(), b"immutable");
        assert_eq!(view.as_slice(), b"immutable");
    }

    #[test]
    fn views_render_as_lossy_utf8() {
        assert_eq!(format!("{}", ByteView::from(b"630".to_vec())), "630");
        assert_eq!(
            format!("{}", ByteView::from(vec![0xff, b'a'])),
            "\u{fffd}a"
        );
    }
}
