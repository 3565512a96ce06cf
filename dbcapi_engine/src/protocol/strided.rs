//! Strided element access over a flat byte block.
//!
//! Column-wise and row-wise parameter layouts differ only in the stride
//! between consecutive elements of one column:
//!
//! - column-wise: `stride == width`, each column contiguous
//! - row-wise: `stride == row width`, columns interleaved

/// Placement of one column inside a byte block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stride {
    pub offset: usize,
    pub stride: usize,
    pub width: usize,
    pub count: usize,
}

impl Stride {
    pub fn contiguous(offset: usize, width: usize, count: usize) -> Self {
        Self {
            offset,
            stride: width,
            width,
            count,
        }
    }

    pub fn is_contiguous(&self) -> bool {
        self.stride == self.width
    }

    /// Byte range of element `index` relative to the block start.
    pub fn element_range(&self, index: usize) -> Option<std::ops::Range<usize>> {
        if index >= self.count {
            return None;
        }
        let start = self.offset + index * self.stride;
        Some(start..start + self.width)
    }

    /// One past the last byte any element touches.
    pub fn end(&self) -> usize {
        if self.count == 0 {
            return self.offset;
        }
        self.offset + (self.count - 1) * self.stride + self.width
    }
}

/// Owned byte block addressed through `Stride`s.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StridedBuffer {
    bytes: Vec<u8>,
}

impl StridedBuffer {
    pub fn with_len(len: usize) -> Self {
        Self {
            bytes: vec![0u8; len],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Writes `value` into element `index`; `value` must be exactly `width` bytes.
    pub fn write(&mut self, stride: &Stride, index: usize, value: &[u8]) -> bool {
        match stride.element_range(index) {
            Some(range) if range.end <= self.bytes.len() && value.len() == stride.width => {
                self.bytes[range].copy_from_slice(value);
                true
            }
            _ => false,
        }
    }

    pub fn view(&self, stride: Stride) -> Option<StridedView<'_>> {
        if stride.end() > self.bytes.len() {
            return None;
        }
        Some(StridedView {
            base: &self.bytes,
            layout: stride,
        })
    }
}

/// Borrowed view of one column of a `StridedBuffer`.
#[derive(Clone, Copy, Debug)]
pub struct StridedView<'a> {
    base: &'a [u8],
    layout: Stride,
}

impl<'a> StridedView<'a> {
    pub fn layout(&self) -> Stride {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.layout.count
    }

    pub fn is_empty(&self) -> bool {
        self.layout.count == 0
    }

    pub fn get(&self, index: usize) -> Option<&'a [u8]> {
        let range = self.layout.element_range(index)?;
        self.base.get(range)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        (0..self.layout.count).filter_map(move |i| self.get(i))
    }

    /// Column data as one contiguous slice when the layout already is
    /// contiguous, otherwise `None`.
    pub fn as_contiguous(&self) -> Option<&'a [u8]> {
        if !self.layout.is_contiguous() {
            return None;
        }
        self.base.get(self.layout.offset..self.layout.end())
    }

    /// Copies the column into a freshly allocated contiguous block.
    pub fn gather(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.layout.count * self.layout.width);
        for element in self.iter() {
            out.extend_from_slice(element);
        }
        out
    }
}
