use image::{GrayImage, Luma};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    pub fn fits_within(&self, frame_width: u32, frame_height: u32) -> bool {
        self.right() <= frame_width as u64 && self.bottom() <= frame_height as u64
    }
}

/// Shape of a region in frame pixel coordinates.
///
/// Serialized externally tagged: `{"rect": {...}}` or `{"polygon": [[x, y], ...]}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Geometry {
    Rect(Rect),
    Polygon(Vec<[u32; 2]>),
}

impl Geometry {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Geometry::Rect(rect) => {
                if rect.width == 0 || rect.height == 0 {
                    return Err(format!(
                        "rectangle must have a positive size, got {}x{}",
                        rect.width, rect.height
                    ));
                }
                Ok(())
            }
            Geometry::Polygon(vertices) => {
                if vertices.len() < 3 {
                    return Err(format!(
                        "polygon needs at least 3 vertices, got {}",
                        vertices.len()
                    ));
                }
                if doubled_area(vertices) == 0 {
                    return Err("polygon has zero area".into());
                }
                Ok(())
            }
        }
    }

    /// Smallest axis-aligned rectangle covering every vertex, inclusive of the
    /// far edge pixels.
    pub fn bounding_rect(&self) -> Rect {
        match self {
            Geometry::Rect(rect) => *rect,
            Geometry::Polygon(vertices) => {
                let min_x = vertices.iter().map(|v| v[0]).min().unwrap_or(0);
                let max_x = vertices.iter().map(|v| v[0]).max().unwrap_or(0);
                let min_y = vertices.iter().map(|v| v[1]).min().unwrap_or(0);
                let max_y = vertices.iter().map(|v| v[1]).max().unwrap_or(0);
                Rect {
                    x: min_x,
                    y: min_y,
                    width: max_x - min_x + 1,
                    height: max_y - min_y + 1,
                }
            }
        }
    }

    /// Inclusion mask over the bounding rectangle (255 inside, 0 outside).
    /// Rectangles cover their whole bounding box and need no mask.
    pub fn mask(&self) -> Option<GrayImage> {
        let Geometry::Polygon(vertices) = self else {
            return None;
        };
        let rect = self.bounding_rect();
        let local: Vec<(i64, i64)> = vertices
            .iter()
            .map(|v| (v[0] as i64 - rect.x as i64, v[1] as i64 - rect.y as i64))
            .collect();

        Some(GrayImage::from_fn(rect.width, rect.height, |x, y| {
            if contains(&local, x as i64, y as i64) {
                Luma([255])
            } else {
                Luma([0])
            }
        }))
    }
}

fn doubled_area(vertices: &[[u32; 2]]) -> i64 {
    let n = vertices.len();
    let mut sum = 0i64;
    for i in 0..n {
        let [x0, y0] = vertices[i];
        let [x1, y1] = vertices[(i + 1) % n];
        sum += x0 as i64 * y1 as i64 - x1 as i64 * y0 as i64;
    }
    sum.abs()
}

/// Even-odd test; points on an edge count as inside.
fn contains(polygon: &[(i64, i64)], px: i64, py: i64) -> bool {
    let n = polygon.len();
    let mut inside = false;
    for i in 0..n {
        let (x0, y0) = polygon[i];
        let (x1, y1) = polygon[(i + 1) % n];

        if on_segment((x0, y0), (x1, y1), (px, py)) {
            return true;
        }

        if (y0 > py) != (y1 > py) {
            // x coordinate of the edge at height py, compared without division
            let lhs = (px - x0) * (y1 - y0);
            let rhs = (x1 - x0) * (py - y0);
            let crosses = if y1 > y0 { lhs < rhs } else { lhs > rhs };
            if crosses {
                inside = !inside;
            }
        }
    }
    inside
}

fn on_segment(a: (i64, i64), b: (i64, i64), p: (i64, i64)) -> bool {
    let cross = (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0);
    cross == 0
        && p.0 >= a.0.min(b.0)
        && p.0 <= a.0.max(b.0)
        && p.1 >= a.1.min(b.1)
        && p.1 <= a.1.max(b.1)
}
