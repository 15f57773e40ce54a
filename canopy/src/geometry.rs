//! Planar polygon helpers in lon/lat degrees.
//!
//! Field boundaries arrive already parsed; this module only needs what the
//! pipeline itself does with them: bounding boxes for provider
//! placeholders, GeoJSON for provider payloads, field-coverage ratios for
//! scene selection and pixel-centre masks for raster reads.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// `[lon, lat]`
pub type Position = [f64; 2];

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    pub fn to_polygon(&self) -> Polygon {
        Polygon {
            exterior: vec![
                [self.west, self.south],
                [self.east, self.south],
                [self.east, self.north],
                [self.west, self.north],
            ],
        }
    }
}

/// Simple polygon without holes. The ring is stored open (the closing
/// vertex is dropped on construction).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    exterior: Vec<Position>,
}

impl Polygon {
    /// Returns `None` for rings with fewer than three distinct vertices.
    pub fn new(mut ring: Vec<Position>) -> Option<Self> {
        if ring.len() > 1 && ring.first() == ring.last() {
            ring.pop();
        }
        (ring.len() >= 3).then_some(Self { exterior: ring })
    }

    pub fn exterior(&self) -> &[Position] {
        &self.exterior
    }

    pub fn bbox(&self) -> BoundingBox {
        let mut bbox = BoundingBox::new(
            f64::INFINITY,
            f64::INFINITY,
            f64::NEG_INFINITY,
            f64::NEG_INFINITY,
        );
        for [x, y] in &self.exterior {
            bbox.west = bbox.west.min(*x);
            bbox.south = bbox.south.min(*y);
            bbox.east = bbox.east.max(*x);
            bbox.north = bbox.north.max(*y);
        }
        bbox
    }

    fn signed_area(&self) -> f64 {
        let n = self.exterior.len();
        let mut sum = 0.0;
        for i in 0..n {
            let [x1, y1] = self.exterior[i];
            let [x2, y2] = self.exterior[(i + 1) % n];
            sum += x1 * y2 - x2 * y1;
        }
        sum / 2.0
    }

    /// Planar area in square degrees.
    pub fn area(&self) -> f64 {
        self.signed_area().abs()
    }

    pub fn is_convex(&self) -> bool {
        let n = self.exterior.len();
        let mut sign = 0.0_f64;
        for i in 0..n {
            let [ax, ay] = self.exterior[i];
            let [bx, by] = self.exterior[(i + 1) % n];
            let [cx, cy] = self.exterior[(i + 2) % n];
            let cross = (bx - ax) * (cy - by) - (by - ay) * (cx - bx);
            if cross.abs() < f64::EPSILON {
                continue;
            }
            if sign == 0.0 {
                sign = cross.signum();
            } else if cross.signum() != sign {
                return false;
            }
        }
        true
    }

    /// Even-odd point-in-polygon test.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let n = self.exterior.len();
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let [xi, yi] = self.exterior[i];
            let [xj, yj] = self.exterior[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi
            {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    /// Sutherland-Hodgman clip of `self` against a convex `clip` polygon.
    pub fn clip_to_convex(&self, clip: &Polygon) -> Option<Polygon> {
        let orientation = clip.signed_area().signum();
        let mut output = self.exterior.clone();
        let n = clip.exterior.len();

        for i in 0..n {
            if output.is_empty() {
                return None;
            }
            let a = clip.exterior[i];
            let b = clip.exterior[(i + 1) % n];
            let inside = |p: &Position| {
                let cross =
                    (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0]);
                cross * orientation >= 0.0
            };

            let input = std::mem::take(&mut output);
            for (k, current) in input.iter().enumerate() {
                let previous = input[(k + input.len() - 1) % input.len()];
                let cur_in = inside(current);
                let prev_in = inside(&previous);
                if cur_in {
                    if !prev_in {
                        output.push(intersect(previous, *current, a, b));
                    }
                    output.push(*current);
                } else if prev_in {
                    output.push(intersect(previous, *current, a, b));
                }
            }
        }

        Polygon::new(output)
    }

    /// Fraction of `self` covered by `footprint`, in `[0, 1]`.
    ///
    /// Non-convex footprints are approximated by their bounding box.
    pub fn coverage_by(&self, footprint: &Polygon) -> f64 {
        let area = self.area();
        if area <= 0.0 {
            return 0.0;
        }
        let clip = if footprint.is_convex() {
            footprint.clone()
        } else {
            footprint.bbox().to_polygon()
        };
        let covered = self
            .clip_to_convex(&clip)
            .map(|p| p.area())
            .unwrap_or(0.0);
        (covered / area).clamp(0.0, 1.0)
    }

    /// GeoJSON `Polygon` geometry with a closed ring.
    pub fn to_geojson(&self) -> Value {
        let mut ring: Vec<Value> =
            self.exterior.iter().map(|[x, y]| json!([x, y])).collect();
        if let Some([x, y]) = self.exterior.first() {
            ring.push(json!([x, y]));
        }
        json!({ "type": "Polygon", "coordinates": [ring] })
    }

    /// GeoJSON `Feature` wrapping the geometry.
    pub fn to_feature(&self) -> Value {
        json!({
            "type": "Feature",
            "properties": {},
            "geometry": self.to_geojson(),
        })
    }

    /// Accepts a `Polygon` geometry or a `Feature` holding one.
    pub fn from_geojson(value: &Value) -> Option<Self> {
        let geometry = match value.get("type")?.as_str()? {
            "Feature" => value.get("geometry")?,
            "Polygon" => value,
            _ => return None,
        };
        if geometry.get("type")?.as_str()? != "Polygon" {
            return None;
        }
        let ring = geometry.get("coordinates")?.as_array()?.first()?;
        let positions = ring
            .as_array()?
            .iter()
            .map(|p| {
                let pair = p.as_array()?;
                Some([pair.first()?.as_f64()?, pair.get(1)?.as_f64()?])
            })
            .collect::<Option<Vec<_>>>()?;
        Polygon::new(positions)
    }

    /// Pixel-centre rasterization onto `transform`.
    pub fn rasterize(
        &self,
        transform: &GeoTransform,
        shape: (usize, usize),
    ) -> Array2<bool> {
        Array2::from_shape_fn(shape, |(row, col)| {
            let (x, y) = transform.pixel_center(row, col);
            self.contains(x, y)
        })
    }
}

fn intersect(p: Position, q: Position, a: Position, b: Position) -> Position {
    let (x1, y1, x2, y2) = (p[0], p[1], q[0], q[1]);
    let (x3, y3, x4, y4) = (a[0], a[1], b[0], b[1]);
    let denom = (x1 - x2) * (y3 - y4) - (y1 - y2) * (x3 - x4);
    if denom.abs() < f64::EPSILON {
        return q;
    }
    let t = ((x1 - x3) * (y3 - y4) - (y1 - y3) * (x3 - x4)) / denom;
    [x1 + t * (x2 - x1), y1 + t * (y2 - y1)]
}

/// North-up affine transform: origin is the top-left corner.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Transform whose grid spans `bbox` with `shape` pixels.
    pub fn covering(bbox: &BoundingBox, shape: (usize, usize)) -> Self {
        let (rows, cols) = shape;
        Self {
            origin_x: bbox.west,
            origin_y: bbox.north,
            pixel_width: (bbox.east - bbox.west) / cols.max(1) as f64,
            pixel_height: (bbox.north - bbox.south) / rows.max(1) as f64,
        }
    }

    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.pixel_width,
            self.origin_y - (row as f64 + 0.5) * self.pixel_height,
        )
    }

    /// Same footprint at `factor` times the resolution.
    pub fn refined(&self, factor: usize) -> Self {
        let factor = factor.max(1) as f64;
        Self {
            pixel_width: self.pixel_width / factor,
            pixel_height: self.pixel_height / factor,
            ..*self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: f64, y0: f64, size: f64) -> Polygon {
        Polygon::new(vec![
            [x0, y0],
            [x0 + size, y0],
            [x0 + size, y0 + size],
            [x0, y0 + size],
            [x0, y0],
        ])
        .unwrap()
    }

    #[test]
    fn closing_vertex_is_dropped() {
        let poly = square(0.0, 0.0, 1.0);
        assert_eq!(poly.exterior().len(), 4);
        assert!(Polygon::new(vec![[0.0, 0.0], [1.0, 1.0], [0.0, 0.0]]).is_none());
    }

    #[test]
    fn bbox_and_area() {
        let poly = square(2.0, 48.0, 0.5);
        let bbox = poly.bbox();
        assert_eq!(bbox, BoundingBox::new(2.0, 48.0, 2.5, 48.5));
        assert!((poly.area() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn coverage_of_half_overlap() {
        let field = square(0.0, 0.0, 2.0);
        let footprint = square(1.0, -5.0, 10.0);
        let ratio = field.coverage_by(&footprint);
        assert!((ratio - 0.5).abs() < 1e-9, "ratio {ratio}");
    }

    #[test]
    fn coverage_full_and_disjoint() {
        let field = square(0.0, 0.0, 1.0);
        assert!((field.coverage_by(&square(-1.0, -1.0, 5.0)) - 1.0).abs() < 1e-9);
        assert_eq!(field.coverage_by(&square(10.0, 10.0, 1.0)), 0.0);
    }

    #[test]
    fn geojson_round_trip_closes_ring() {
        let poly = square(0.0, 0.0, 1.0);
        let feature = poly.to_feature();
        let ring = &feature["geometry"]["coordinates"][0];
        assert_eq!(ring.as_array().unwrap().len(), 5);
        assert_eq!(Polygon::from_geojson(&feature), Some(poly));
    }

    #[test]
    fn rasterize_marks_pixel_centres() {
        let poly = square(0.0, 0.0, 1.0);
        let transform = GeoTransform::covering(
            &BoundingBox::new(0.0, 0.0, 2.0, 1.0),
            (2, 4),
        );
        let mask = poly.rasterize(&transform, (2, 4));
        assert_eq!(mask.iter().filter(|v| **v).count(), 4);
        assert!(mask[[0, 0]] && mask[[1, 1]]);
        assert!(!mask[[0, 2]]);
    }
}
