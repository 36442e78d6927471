/// Pixel regions built from ellipses, stored as row spans
use crate::geometry::{BBox, Ellipse, EllipseAxes, Point2, Quadrupole};
use crate::image::MaskedImage;

/// Furthest pixel coordinate a footprint may reach from the origin
const COORD_LIMIT: i32 = 1 << 29;

/// A run of pixels `x0..=x1` on row `y`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub y: i32,
    pub x0: i32,
    pub x1: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Footprint {
    spans: Vec<Span>,
    bbox: BBox,
}

impl Footprint {
    pub fn from_spans(spans: Vec<Span>) -> Self {
        let spans: Vec<Span> = spans.into_iter().filter(|s| s.x1 >= s.x0).collect();
        let bbox = spans.iter().fold(BBox::new(0, 0, -1, -1), |acc, s| {
            if acc.is_empty() {
                BBox::new(s.x0, s.y, s.x1, s.y)
            } else {
                BBox::new(
                    acc.x_min.min(s.x0),
                    acc.y_min.min(s.y),
                    acc.x_max.max(s.x1),
                    acc.y_max.max(s.y),
                )
            }
        });
        Self { spans, bbox }
    }

    /// All pixels whose centers lie inside the ellipse
    pub fn from_ellipse(ellipse: &Ellipse) -> Self {
        let unbounded = BBox::new(-COORD_LIMIT, -COORD_LIMIT, COORD_LIMIT, COORD_LIMIT);
        Self::from_ellipse_in(ellipse, &unbounded)
    }

    /// The ellipse footprint restricted to `bbox`, without visiting rows or
    /// columns outside it
    pub fn from_ellipse_in(ellipse: &Ellipse, bbox: &BBox) -> Self {
        let q = ellipse.axes.to_quadrupole();
        let det = q.ixx * q.iyy - q.ixy * q.ixy;
        if !(det > 0.0) || !det.is_finite() || bbox.is_empty() {
            return Self::from_spans(Vec::new());
        }
        // Conic coefficients of the inverse quadrupole
        let a = q.iyy / det;
        let b = -q.ixy / det;
        let c = q.ixx / det;

        let Point2 { x: cx, y: cy } = ellipse.center;
        let half_height = q.iyy.sqrt();
        let clamp_row = |v: f64| v.clamp(bbox.y_min as f64, bbox.y_max as f64) as i32;
        let (x_lo, x_hi) = (bbox.x_min as f64, bbox.x_max as f64);
        let y_lo = (cy - half_height).ceil();
        let y_hi = (cy + half_height).floor();
        if !(y_lo <= y_hi) || y_hi < bbox.y_min as f64 || y_lo > bbox.y_max as f64 {
            return Self::from_spans(Vec::new());
        }
        let (y_min, y_max) = (clamp_row(y_lo), clamp_row(y_hi));

        let mut spans = Vec::new();
        for y in y_min..=y_max {
            let dy = y as f64 - cy;
            let disc = (b * dy) * (b * dy) - a * (c * dy * dy - 1.0);
            if disc < 0.0 {
                continue;
            }
            let root = disc.sqrt();
            let x0 = (cx + (-b * dy - root) / a).ceil().clamp(x_lo, x_hi + 1.0) as i64;
            let x1 = (cx + (-b * dy + root) / a).floor().clamp(x_lo - 1.0, x_hi) as i64;
            if x1 >= x0 {
                spans.push(Span {
                    y,
                    x0: x0 as i32,
                    x1: x1 as i32,
                });
            }
        }
        Self::from_spans(spans)
    }

    pub fn circle(center: Point2, radius: f64) -> Self {
        Self::from_ellipse(&Ellipse::new(EllipseAxes::circle(radius), center))
    }

    /// The ellipse footprint restricted to `bbox`
    pub fn clipped(&self, bbox: &BBox) -> Self {
        let spans = self
            .spans
            .iter()
            .filter(|s| s.y >= bbox.y_min && s.y <= bbox.y_max)
            .map(|s| Span {
                y: s.y,
                x0: s.x0.max(bbox.x_min),
                x1: s.x1.min(bbox.x_max),
            })
            .collect();
        Self::from_spans(spans)
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Bounding box; empty when the footprint has no pixels
    pub fn bbox(&self) -> BBox {
        self.bbox
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn area(&self) -> usize {
        self.spans.iter().map(|s| (s.x1 - s.x0 + 1) as usize).sum()
    }

    /// Every pixel in the footprint, row by row
    pub fn pixels(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.spans
            .iter()
            .flat_map(|s| (s.x0..=s.x1).map(move |x| (x, s.y)))
    }

    /// Visit every pixel that is also inside `image`, with its value and variance
    pub fn for_each_pixel<F>(&self, image: &MaskedImage, mut f: F)
    where
        F: FnMut(i32, i32, f64, f64),
    {
        for (x, y) in self.pixels() {
            if let Some((value, variance)) = image.pixel(x, y) {
                f(x, y, value, variance);
            }
        }
    }

    /// Unweighted second moments of the member pixels
    pub fn shape(&self) -> Option<EllipseAxes> {
        let n = self.area();
        if n == 0 {
            return None;
        }
        let (mut sx, mut sy) = (0.0, 0.0);
        for (x, y) in self.pixels() {
            sx += x as f64;
            sy += y as f64;
        }
        let (xbar, ybar) = (sx / n as f64, sy / n as f64);

        let (mut ixx, mut iyy, mut ixy) = (0.0, 0.0, 0.0);
        for (x, y) in self.pixels() {
            let dx = x as f64 - xbar;
            let dy = y as f64 - ybar;
            ixx += dx * dx;
            iyy += dy * dy;
            ixy += dx * dy;
        }
        Some(EllipseAxes::from_quadrupole(&Quadrupole {
            ixx: ixx / n as f64,
            iyy: iyy / n as f64,
            ixy: ixy / n as f64,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circle_footprint() {
        let foot = Footprint::circle(Point2::new(10.0, 10.0), 1.0);
        // The center pixel plus its four neighbours
        assert_eq!(foot.area(), 5);
        assert_eq!(foot.bbox(), BBox::new(9, 9, 11, 11));

        let foot = Footprint::circle(Point2::new(0.0, 0.0), 5.5);
        // Lattice points with x^2 + y^2 <= 30.25
        assert_eq!(foot.area(), 97);
    }

    #[test]
    fn test_rotated_ellipse_is_symmetric() {
        let axes = EllipseAxes::new(6.0, 2.0, 0.6);
        let foot = Footprint::from_ellipse(&Ellipse::new(axes, Point2::new(0.0, 0.0)));
        for (x, y) in foot.pixels() {
            assert!(foot.pixels().any(|(u, v)| u == -x && v == -y));
        }
        // Area within a few percent of pi*a*b
        let area = foot.area() as f64;
        let expected = std::f64::consts::PI * 12.0;
        assert!((area - expected).abs() / expected < 0.1);
    }

    #[test]
    fn test_clipping() {
        let foot = Footprint::circle(Point2::new(1.0, 1.0), 3.0);
        let image_box = BBox::new(0, 0, 9, 9);
        let clipped = foot.clipped(&image_box);
        assert!(image_box.contains(&clipped.bbox()));
        assert!(clipped.area() < foot.area());
        assert!(clipped.pixels().all(|(x, y)| x >= 0 && y >= 0));
    }

    #[test]
    fn test_bounded_construction_matches_clipping() {
        let ellipse = Ellipse::new(EllipseAxes::new(7.0, 3.0, 0.8), Point2::new(2.3, 8.6));
        let image_box = BBox::new(0, 0, 9, 9);
        let bounded = Footprint::from_ellipse_in(&ellipse, &image_box);
        assert_eq!(bounded, Footprint::from_ellipse(&ellipse).clipped(&image_box));

        // Entirely left of the box
        let outside = Ellipse::new(EllipseAxes::circle(2.0), Point2::new(-10.0, 5.0));
        assert!(Footprint::from_ellipse_in(&outside, &image_box).is_empty());
    }

    #[test]
    fn test_huge_ellipse_stays_in_box() {
        let ellipse = Ellipse::new(EllipseAxes::circle(1e12), Point2::new(5.0, 5.0));
        let image_box = BBox::new(0, 0, 9, 9);
        let foot = Footprint::from_ellipse_in(&ellipse, &image_box);
        assert_eq!(foot.area(), 100);
        assert_eq!(foot.bbox(), image_box);
    }

    #[test]
    fn test_degenerate_ellipse_is_empty() {
        let axes = EllipseAxes::new(3.0, 0.0, 0.0);
        let foot = Footprint::from_ellipse(&Ellipse::new(axes, Point2::new(5.0, 5.0)));
        assert!(foot.is_empty());
        assert!(foot.bbox().is_empty());
        assert!(foot.shape().is_none());
    }

    #[test]
    fn test_disk_shape() {
        // For a disk of radius R, <x^2> = R^2/4, so the determinant radius is R/2
        let r = 20.3;
        let foot = Footprint::circle(Point2::new(0.0, 0.0), r);
        let shape = foot.shape().unwrap();
        assert!((shape.determinant_radius() - r / 2.0).abs() < 0.1);
        assert!((shape.axis_ratio() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_for_each_pixel_skips_outside() {
        let image = MaskedImage::new(4, 4);
        let foot = Footprint::circle(Point2::new(0.0, 0.0), 1.0);
        let mut count = 0;
        foot.for_each_pixel(&image, |_, _, _, _| count += 1);
        // (0,0), (1,0), (0,1) are inside the image
        assert_eq!(count, 3);
    }
}
