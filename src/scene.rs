//! Geometry that changes every frame.
//!
//! A scene always produces the same number of vertices, so a slot sized for
//! the first frame fits every frame after it.

use nalgebra_glm as glm;

use crate::shader_types::Vertex;

/// Something that can fill in a frame's vertices.
pub trait Scene: Send {
    /// How many vertices every frame has.
    fn vertex_count(&self) -> usize;

    /// Write the vertices for frame number `frame`. `vertices` is exactly
    /// [`Scene::vertex_count()`] long, and its order is the draw order.
    fn update(&mut self, frame: u64, vertices: &mut [Vertex]);
}

/// A single triangle sliding left and right while its colors cycle.
#[derive(Clone, Debug)]
pub struct AnimatedTriangle {
    /// How far the triangle slides either side of center, in NDC units.
    pub amplitude: f32,
    /// Radians of animation advanced per frame.
    pub speed: f32,
}

impl AnimatedTriangle {
    const CORNERS: [[f32; 2]; 3] = [[-0.5, -0.5], [0.5, -0.5], [0.0, 0.5]];
}

impl Default for AnimatedTriangle {
    fn default() -> Self {
        Self {
            amplitude: 0.25,
            speed: 0.05,
        }
    }
}

impl Scene for AnimatedTriangle {
    fn vertex_count(&self) -> usize {
        Self::CORNERS.len()
    }

    fn update(&mut self, frame: u64, vertices: &mut [Vertex]) {
        let phase = frame as f32 * self.speed;
        let offset = glm::vec2(self.amplitude * phase.sin(), 0.0);

        for (i, (vertex, corner)) in vertices.iter_mut().zip(Self::CORNERS).enumerate() {
            let position = glm::vec2(corner[0], corner[1]) + offset;
            // Each corner is a third of a turn out of phase with the next.
            let hue = phase + i as f32 * glm::two_pi::<f32>() / 3.0;
            let color = glm::vec3(hue.sin(), (hue + 2.0).sin(), (hue + 4.0).sin())
                .map(|c| c * 0.5 + 0.5);

            *vertex = Vertex::new(
                [position.x, position.y],
                [color.x, color.y, color.z, 1.0],
            );
        }
    }
}

/// A grid of square sprites bobbing up and down on a travelling wave.
#[derive(Clone, Debug)]
pub struct SpriteGrid {
    columns: usize,
    rows: usize,
    /// Edge length of a sprite, in NDC units.
    sprite_size: f32,
    /// Peak vertical displacement of the wave, in NDC units.
    wave_magnitude: f32,
    /// Phase advanced per frame.
    wave_speed: f32,
    top_color: glm::Vec4,
    bottom_color: glm::Vec4,
}

impl SpriteGrid {
    pub const VERTICES_PER_SPRITE: usize = 6;

    pub fn new(columns: usize, rows: usize) -> Self {
        Self {
            columns,
            rows,
            sprite_size: 1.6 / columns.max(rows).max(1) as f32,
            wave_magnitude: 0.1,
            wave_speed: 0.1,
            top_color: glm::vec4(0.9, 0.3, 0.2, 1.0),
            bottom_color: glm::vec4(0.2, 0.4, 0.9, 1.0),
        }
    }

    #[inline]
    pub fn sprite_count(&self) -> usize {
        self.columns * self.rows
    }

    /// Resting center of the sprite at `column`, `row`.
    fn home(&self, column: usize, row: usize) -> glm::Vec2 {
        let spacing = 2.0 / self.columns.max(self.rows) as f32;
        let origin = glm::vec2(
            -spacing * (self.columns as f32 - 1.0) / 2.0,
            spacing * (self.rows as f32 - 1.0) / 2.0,
        );
        origin + glm::vec2(column as f32 * spacing, -(row as f32) * spacing)
    }

    fn row_color(&self, row: usize) -> glm::Vec4 {
        let t = if self.rows > 1 {
            row as f32 / (self.rows - 1) as f32
        } else {
            0.0
        };
        glm::mix(&self.top_color, &self.bottom_color, t)
    }
}

impl Default for SpriteGrid {
    fn default() -> Self {
        Self::new(25, 15)
    }
}

impl Scene for SpriteGrid {
    fn vertex_count(&self) -> usize {
        self.sprite_count() * Self::VERTICES_PER_SPRITE
    }

    fn update(&mut self, frame: u64, vertices: &mut [Vertex]) {
        let wave_position = frame as f32 * self.wave_speed;
        let half = self.sprite_size / 2.0;

        let sprites = (0..self.rows).flat_map(|row| (0..self.columns).map(move |col| (col, row)));
        let quads = vertices.chunks_exact_mut(Self::VERTICES_PER_SPRITE);
        for ((column, row), quad) in sprites.zip(quads) {
            let mut center = self.home(column, row);
            center.y += self.wave_magnitude * (center.x * glm::pi::<f32>() + wave_position).sin();

            let color = self.row_color(row);
            let color = [color.x, color.y, color.z, color.w];

            let (left, right) = (center.x - half, center.x + half);
            let (bottom, top) = (center.y - half, center.y + half);

            // Two counter-clockwise triangles.
            let corners = [
                [right, bottom],
                [left, bottom],
                [left, top],
                [right, bottom],
                [left, top],
                [right, top],
            ];
            for (vertex, corner) in quad.iter_mut().zip(corners) {
                *vertex = Vertex::new(corner, color);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(scene: &mut dyn Scene, frame: u64) -> Vec<Vertex> {
        let mut vertices = vec![Vertex::default(); scene.vertex_count()];
        scene.update(frame, &mut vertices);
        vertices
    }

    fn in_range(vertices: &[Vertex]) -> bool {
        vertices.iter().all(|v| {
            v.position.iter().all(|p| (-1.0..=1.0).contains(p))
                && v.color.iter().all(|c| (0.0..=1.0).contains(c))
        })
    }

    #[test]
    fn triangle_has_three_vertices_that_move() {
        let mut triangle = AnimatedTriangle::default();
        assert_eq!(triangle.vertex_count(), 3);

        let first = render(&mut triangle, 0);
        let later = render(&mut triangle, 30);
        assert_ne!(first[0].position, later[0].position);
        assert!(in_range(&first));
        assert!(in_range(&later));
    }

    #[test]
    fn triangle_is_deterministic_per_frame() {
        let mut a = AnimatedTriangle::default();
        let mut b = AnimatedTriangle::default();
        assert_eq!(render(&mut a, 17), render(&mut b, 17));
    }

    #[test]
    fn sprite_grid_fills_every_vertex_in_range() {
        let mut grid = SpriteGrid::default();
        assert_eq!(grid.sprite_count(), 25 * 15);
        assert_eq!(grid.vertex_count(), 25 * 15 * 6);

        for frame in [0, 1, 100, 12_345] {
            let vertices = render(&mut grid, frame);
            assert!(in_range(&vertices), "frame {frame} left NDC");
            assert!(vertices.iter().all(|v| v.color[3] == 1.0));
        }
    }

    #[test]
    fn sprites_ride_the_wave() {
        let mut grid = SpriteGrid::new(4, 1);
        let before = render(&mut grid, 0);
        let after = render(&mut grid, 5);

        // Same columns, different heights.
        assert_eq!(before[0].position[0], after[0].position[0]);
        assert_ne!(before[0].position[1], after[0].position[1]);
    }
}
