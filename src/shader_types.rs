//! Types and binding indices shared between the host and the vertex stage.
//!
//! Everything in here is part of a fixed ABI: the shader side declares
//!
//! ```text
//! struct Vertex { float2 position; float4 color; };
//! enum VertexInputIndex { Vertices = 0, ViewportSize = 1 };
//! ```
//!
//! and reads it straight out of the buffer slots this crate writes. Shading
//! languages align a `float4` to 16 bytes, so the host struct carries explicit
//! padding to land `color` at the same offset. If you change anything here,
//! change the shader too.

use std::mem::size_of;

use bytemuck::{Pod, Zeroable};

/// Bumped whenever the layout of anything in this module changes.
pub const SHADER_ABI_VERSION: u32 = 1;

/// A single vertex: a position in normalized device coordinates and an RGBA
/// color.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    /// Position in normalized device coordinates, each component in `[-1, 1]`.
    pub position: [f32; 2],
    _padding: [f32; 2],
    /// Linear RGBA, each channel in `[0, 1]`.
    pub color: [f32; 4],
}

impl Vertex {
    /// Byte offset of [`Vertex::position`].
    pub const POSITION_OFFSET: usize = 0;
    /// Byte offset of [`Vertex::color`].
    pub const COLOR_OFFSET: usize = 16;
    /// Distance in bytes between consecutive vertices.
    pub const STRIDE: usize = size_of::<Self>();

    pub const fn new(position: [f32; 2], color: [f32; 4]) -> Self {
        Self {
            position,
            _padding: [0.0; 2],
            color,
        }
    }
}

/// Indices into the vertex stage's binding table.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum VertexInputIndex {
    Vertices = 0,
    ViewportSize = 1,
}

impl VertexInputIndex {
    /// Every binding the vertex stage expects. None of them may be left
    /// unbound when geometry is drawn.
    pub const ALL: [Self; 2] = [Self::Vertices, Self::ViewportSize];

    #[inline]
    pub const fn binding(self) -> u32 {
        self as u32
    }
}

/// Scalar uniforms bound at [`VertexInputIndex::ViewportSize`].
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ViewportUniforms {
    /// Drawable size in pixels.
    pub viewport_size: [u32; 2],
    _padding: [u32; 2],
}

impl ViewportUniforms {
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            viewport_size: [width, height],
            _padding: [0; 2],
        }
    }
}

/// Alignment of every binding inside a slot.
const BINDING_ALIGNMENT: usize = 16;

/// Where each binding lives inside one buffer slot.
///
/// Vertices start at offset 0; the viewport uniforms follow at the next
/// 16-byte boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SlotLayout {
    vertex_count: usize,
}

/// Errors from reading or writing a slot through a [`SlotLayout`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("slot holds {capacity} bytes but the layout needs {required}")]
    SlotTooSmall { capacity: usize, required: usize },
    #[error("layout is for {expected} vertices, got {actual}")]
    VertexCountMismatch { expected: usize, actual: usize },
}

impl SlotLayout {
    pub const fn for_vertices(vertex_count: usize) -> Self {
        Self { vertex_count }
    }

    #[inline]
    pub const fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    /// Byte offset of the data bound at `index`.
    pub const fn offset_of(&self, index: VertexInputIndex) -> usize {
        match index {
            VertexInputIndex::Vertices => 0,
            VertexInputIndex::ViewportSize => {
                align_up(self.vertices_byte_size(), BINDING_ALIGNMENT)
            }
        }
    }

    #[inline]
    pub const fn vertices_byte_size(&self) -> usize {
        self.vertex_count * Vertex::STRIDE
    }

    /// Total number of bytes one slot must hold.
    pub const fn byte_size(&self) -> usize {
        self.offset_of(VertexInputIndex::ViewportSize) + size_of::<ViewportUniforms>()
    }

    /// Write one frame's worth of data into `bytes`.
    pub fn write(
        &self,
        bytes: &mut [u8],
        vertices: &[Vertex],
        uniforms: &ViewportUniforms,
    ) -> Result<(), LayoutError> {
        self.check(bytes.len())?;
        if vertices.len() != self.vertex_count {
            return Err(LayoutError::VertexCountMismatch {
                expected: self.vertex_count,
                actual: vertices.len(),
            });
        }

        let vertices_end = self.vertices_byte_size();
        bytes[..vertices_end].copy_from_slice(bytemuck::cast_slice(vertices));

        let uniforms_start = self.offset_of(VertexInputIndex::ViewportSize);
        bytes[uniforms_start..uniforms_start + size_of::<ViewportUniforms>()]
            .copy_from_slice(bytemuck::bytes_of(uniforms));

        Ok(())
    }

    /// Read back what [`SlotLayout::write()`] put into `bytes`.
    pub fn read(&self, bytes: &[u8]) -> Result<(Vec<Vertex>, ViewportUniforms), LayoutError> {
        self.check(bytes.len())?;

        // Slot memory carries no alignment guarantee beyond a byte, so copy
        // out rather than cast in place.
        let vertices = bytes[..self.vertices_byte_size()]
            .chunks_exact(Vertex::STRIDE)
            .map(bytemuck::pod_read_unaligned)
            .collect();

        let uniforms_start = self.offset_of(VertexInputIndex::ViewportSize);
        let uniforms = bytemuck::pod_read_unaligned(
            &bytes[uniforms_start..uniforms_start + size_of::<ViewportUniforms>()],
        );

        Ok((vertices, uniforms))
    }

    fn check(&self, capacity: usize) -> Result<(), LayoutError> {
        let required = self.byte_size();
        if capacity < required {
            Err(LayoutError::SlotTooSmall { capacity, required })
        } else {
            Ok(())
        }
    }
}

const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of};

    #[test]
    fn vertex_layout_matches_shader_side() {
        assert_eq!(size_of::<Vertex>(), 32);
        assert_eq!(offset_of!(Vertex, position), Vertex::POSITION_OFFSET);
        assert_eq!(offset_of!(Vertex, color), Vertex::COLOR_OFFSET);
        assert_eq!(align_of::<Vertex>(), 4);
    }

    #[test]
    fn viewport_uniforms_are_one_vector_wide() {
        assert_eq!(size_of::<ViewportUniforms>(), 16);
        assert_eq!(offset_of!(ViewportUniforms, viewport_size), 0);
    }

    #[test]
    fn binding_indices_are_stable() {
        assert_eq!(VertexInputIndex::Vertices.binding(), 0);
        assert_eq!(VertexInputIndex::ViewportSize.binding(), 1);
        assert_eq!(VertexInputIndex::ALL.len(), 2);
    }

    #[test]
    fn uniforms_follow_vertices_on_an_aligned_boundary() {
        let layout = SlotLayout::for_vertices(3);
        assert_eq!(layout.offset_of(VertexInputIndex::Vertices), 0);
        assert_eq!(layout.offset_of(VertexInputIndex::ViewportSize), 96);
        assert_eq!(layout.byte_size(), 112);

        let empty = SlotLayout::for_vertices(0);
        assert_eq!(empty.offset_of(VertexInputIndex::ViewportSize), 0);
        assert_eq!(empty.byte_size(), 16);
    }

    #[test]
    fn written_frame_reads_back_field_by_field() {
        let layout = SlotLayout::for_vertices(3);
        let vertices = [
            Vertex::new([-0.5, -0.5], [1.0, 0.0, 0.0, 1.0]),
            Vertex::new([0.5, -0.5], [0.0, 1.0, 0.0, 1.0]),
            Vertex::new([0.0, 0.5], [0.0, 0.0, 1.0, 0.5]),
        ];
        let uniforms = ViewportUniforms::new(1280, 720);

        // Offset by one byte to make sure nothing relies on alignment.
        let mut backing = vec![0xAAu8; layout.byte_size() + 1];
        let bytes = &mut backing[1..];
        layout.write(bytes, &vertices, &uniforms).unwrap();

        let (read_vertices, read_uniforms) = layout.read(bytes).unwrap();
        assert_eq!(read_vertices.len(), vertices.len());
        for (read, written) in read_vertices.iter().zip(&vertices) {
            assert_eq!(read.position, written.position);
            assert_eq!(read.color, written.color);
        }
        assert_eq!(read_uniforms.viewport_size, [1280, 720]);
    }

    #[test]
    fn empty_layout_reads_back_only_uniforms() {
        let layout = SlotLayout::for_vertices(0);
        let mut bytes = vec![0u8; layout.byte_size()];
        layout
            .write(&mut bytes, &[], &ViewportUniforms::new(4, 3))
            .unwrap();

        let (vertices, uniforms) = layout.read(&bytes).unwrap();
        assert!(vertices.is_empty());
        assert_eq!(uniforms, ViewportUniforms::new(4, 3));
    }

    #[test]
    fn rejects_short_slots_and_wrong_vertex_counts() {
        let layout = SlotLayout::for_vertices(3);
        let mut small = vec![0u8; layout.byte_size() - 1];
        assert_eq!(
            layout.write(&mut small, &[Vertex::default(); 3], &ViewportUniforms::default()),
            Err(LayoutError::SlotTooSmall {
                capacity: 111,
                required: 112
            })
        );

        let mut bytes = vec![0u8; layout.byte_size()];
        assert_eq!(
            layout.write(&mut bytes, &[Vertex::default(); 2], &ViewportUniforms::default()),
            Err(LayoutError::VertexCountMismatch {
                expected: 3,
                actual: 2
            })
        );
    }
}
