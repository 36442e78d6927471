/// Geometry primitives: points, integer boxes, ellipses and affine transforms
use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI};
use std::fmt;

/// A position in parent-image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Integer pixel box with inclusive bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBox {
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
}

impl BBox {
    pub fn new(x_min: i32, y_min: i32, x_max: i32, y_max: i32) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    /// Box of the given dimensions starting at (x0, y0)
    pub fn from_origin(x0: i32, y0: i32, width: usize, height: usize) -> Self {
        Self::new(x0, y0, x0 + width as i32 - 1, y0 + height as i32 - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.x_max < self.x_min || self.y_max < self.y_min
    }

    pub fn width(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.x_max - self.x_min + 1) as usize
        }
    }

    pub fn height(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.y_max - self.y_min + 1) as usize
        }
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.x_min && x <= self.x_max && y >= self.y_min && y <= self.y_max
    }

    /// Is `other` entirely inside this box?
    pub fn contains(&self, other: &BBox) -> bool {
        other.x_min >= self.x_min
            && other.y_min >= self.y_min
            && other.x_max <= self.x_max
            && other.y_max <= self.y_max
    }

    /// Grow the box by `nx` columns and `ny` rows on every side
    pub fn grown(&self, nx: i32, ny: i32) -> Self {
        Self::new(
            self.x_min - nx,
            self.y_min - ny,
            self.x_max + nx,
            self.y_max + ny,
        )
    }

    /// Intersection with `other`; may be empty
    pub fn clipped(&self, other: &BBox) -> Self {
        Self::new(
            self.x_min.max(other.x_min),
            self.y_min.max(other.y_min),
            self.x_max.min(other.x_max),
            self.y_max.min(other.y_max),
        )
    }
}

impl fmt::Display for BBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{}--{},{}",
            self.x_min, self.y_min, self.x_max, self.y_max
        )
    }
}

/// Second moments of an ellipse
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quadrupole {
    pub ixx: f64,
    pub iyy: f64,
    pub ixy: f64,
}

impl Quadrupole {
    pub fn determinant_radius(&self) -> f64 {
        (self.ixx * self.iyy - self.ixy * self.ixy).max(0.0).sqrt().sqrt()
    }

    fn matrix(&self) -> Matrix2<f64> {
        Matrix2::new(self.ixx, self.ixy, self.ixy, self.iyy)
    }
}

/// Ellipse core: semi-major axis `a`, semi-minor axis `b` and position angle `theta`
/// (radians, +ve from the x axis).
///
/// Constructors keep `a >= b >= 0` and `theta` in (-pi/2, pi/2].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EllipseAxes {
    pub a: f64,
    pub b: f64,
    pub theta: f64,
}

impl EllipseAxes {
    pub fn new(a: f64, b: f64, theta: f64) -> Self {
        let (a, b) = (a.abs(), b.abs());
        let (a, b, theta) = if b > a {
            (b, a, theta + FRAC_PI_2)
        } else {
            (a, b, theta)
        };
        Self {
            a,
            b,
            theta: normalize_angle(theta),
        }
    }

    pub fn circle(radius: f64) -> Self {
        Self::new(radius, radius, 0.0)
    }

    /// `sqrt(a*b)`, the scalar size we use throughout
    pub fn determinant_radius(&self) -> f64 {
        (self.a * self.b).sqrt()
    }

    /// Axis ratio b/a
    pub fn axis_ratio(&self) -> f64 {
        self.b / self.a
    }

    /// Finite axes with a non-zero area
    pub fn is_valid(&self) -> bool {
        self.a.is_finite()
            && self.b.is_finite()
            && self.theta.is_finite()
            && self.b > 0.0
    }

    pub fn scale(&mut self, factor: f64) {
        self.a *= factor;
        self.b *= factor;
    }

    pub fn scaled(&self, factor: f64) -> Self {
        let mut axes = *self;
        axes.scale(factor);
        axes
    }

    /// Uniformly rescale so that the determinant radius becomes `radius`
    pub fn with_determinant_radius(&self, radius: f64) -> Self {
        self.scaled(radius / self.determinant_radius())
    }

    pub fn to_quadrupole(&self) -> Quadrupole {
        let (s, c) = self.theta.sin_cos();
        let a2 = self.a * self.a;
        let b2 = self.b * self.b;
        Quadrupole {
            ixx: a2 * c * c + b2 * s * s,
            iyy: a2 * s * s + b2 * c * c,
            ixy: (a2 - b2) * c * s,
        }
    }

    pub fn from_quadrupole(q: &Quadrupole) -> Self {
        let xx_p_yy = q.ixx + q.iyy;
        let xx_m_yy = q.ixx - q.iyy;
        let t = xx_m_yy.hypot(2.0 * q.ixy);
        let a = (0.5 * (xx_p_yy + t)).max(0.0).sqrt();
        let b = (0.5 * (xx_p_yy - t)).max(0.0).sqrt();
        let theta = 0.5 * (2.0 * q.ixy).atan2(xx_m_yy);
        Self::new(a, b, theta)
    }

    /// Apply a linear map to the ellipse: Q' = M Q M^T
    pub fn transform(&self, linear: &Matrix2<f64>) -> Self {
        let q = linear * self.to_quadrupole().matrix() * linear.transpose();
        Self::from_quadrupole(&Quadrupole {
            ixx: q[(0, 0)],
            iyy: q[(1, 1)],
            ixy: 0.5 * (q[(0, 1)] + q[(1, 0)]),
        })
    }
}

fn normalize_angle(theta: f64) -> f64 {
    let mut t = theta % PI;
    if t > FRAC_PI_2 {
        t -= PI;
    } else if t <= -FRAC_PI_2 {
        t += PI;
    }
    t
}

/// An ellipse core placed at a center
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ellipse {
    pub center: Point2,
    pub axes: EllipseAxes,
}

impl Ellipse {
    pub fn new(axes: EllipseAxes, center: Point2) -> Self {
        Self { center, axes }
    }

    /// Half-extents of the ellipse along x and y
    pub fn half_extent(&self) -> (f64, f64) {
        let q = self.axes.to_quadrupole();
        (q.ixx.max(0.0).sqrt(), q.iyy.max(0.0).sqrt())
    }

    /// Smallest box holding every pixel that overlaps the ellipse
    pub fn pixel_bbox(&self) -> BBox {
        let (dx, dy) = self.half_extent();
        BBox::new(
            (self.center.x - dx + 0.5).floor() as i32,
            (self.center.y - dy + 0.5).floor() as i32,
            (self.center.x + dx + 0.5).floor() as i32,
            (self.center.y + dy + 0.5).floor() as i32,
        )
    }

    /// Is the point inside (or on) the ellipse?
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let (s, c) = self.axes.theta.sin_cos();
        let dx = x - self.center.x;
        let dy = y - self.center.y;
        let u = (dx * c + dy * s) / self.axes.a;
        let v = (-dx * s + dy * c) / self.axes.b;
        u * u + v * v <= 1.0
    }
}

impl fmt::Display for Ellipse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "at ({:.3}, {:.3}) radius {},{} theta {}",
            self.center.x,
            self.center.y,
            self.axes.a,
            self.axes.b,
            self.axes.theta.to_degrees()
        )
    }
}

/// x' = L x + t
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    linear: Matrix2<f64>,
    translation: Vector2<f64>,
}

impl AffineTransform {
    /// Parameters in the order `[a, b, c, d, tx, ty]` where
    /// x' = a x + b y + tx and y' = c x + d y + ty
    pub fn new(params: [f64; 6]) -> Self {
        let [a, b, c, d, tx, ty] = params;
        Self {
            linear: Matrix2::new(a, b, c, d),
            translation: Vector2::new(tx, ty),
        }
    }

    pub fn identity() -> Self {
        Self::new([1.0, 0.0, 0.0, 1.0, 0.0, 0.0])
    }

    pub fn linear(&self) -> &Matrix2<f64> {
        &self.linear
    }

    pub fn apply(&self, point: Point2) -> Point2 {
        let p = self.linear * Vector2::new(point.x, point.y) + self.translation;
        Point2::new(p.x, p.y)
    }
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axes_are_canonical() {
        let axes = EllipseAxes::new(2.0, 5.0, 0.3);
        assert_eq!(axes.a, 5.0);
        assert_eq!(axes.b, 2.0);
        assert!((axes.theta - (0.3 + FRAC_PI_2 - PI)).abs() < 1e-12);

        let axes = EllipseAxes::new(3.0, 1.0, 2.0 * PI + 0.1);
        assert!((axes.theta - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_determinant_radius_and_scale() {
        let axes = EllipseAxes::new(4.0, 1.0, 0.0);
        assert!((axes.determinant_radius() - 2.0).abs() < 1e-12);

        let scaled = axes.with_determinant_radius(3.0);
        assert!((scaled.determinant_radius() - 3.0).abs() < 1e-12);
        assert!((scaled.axis_ratio() - 0.25).abs() < 1e-12);
        assert_eq!(scaled.theta, axes.theta);
    }

    #[test]
    fn test_quadrupole_round_trip() {
        let axes = EllipseAxes::new(3.0, 1.5, -0.7);
        let back = EllipseAxes::from_quadrupole(&axes.to_quadrupole());
        assert!((back.a - 3.0).abs() < 1e-12);
        assert!((back.b - 1.5).abs() < 1e-12);
        assert!((back.theta + 0.7).abs() < 1e-12);
        assert!((axes.to_quadrupole().determinant_radius() - axes.determinant_radius()).abs() < 1e-12);
    }

    #[test]
    fn test_transform_rotation_and_scale() {
        let axes = EllipseAxes::new(3.0, 1.0, 0.0);
        let (s, c) = 0.5_f64.sin_cos();
        let rot = Matrix2::new(c, -s, s, c);
        let rotated = axes.transform(&rot);
        assert!((rotated.a - 3.0).abs() < 1e-12);
        assert!((rotated.b - 1.0).abs() < 1e-12);
        assert!((rotated.theta - 0.5).abs() < 1e-12);

        let doubled = axes.transform(&Matrix2::new(2.0, 0.0, 0.0, 2.0));
        assert!((doubled.determinant_radius() - 2.0 * axes.determinant_radius()).abs() < 1e-12);
    }

    #[test]
    fn test_bbox_ops() {
        let image = BBox::from_origin(10, 20, 100, 50);
        assert_eq!(image, BBox::new(10, 20, 109, 69));
        assert_eq!(image.width(), 100);
        assert_eq!(image.height(), 50);

        let inner = BBox::new(12, 22, 30, 40);
        assert!(image.contains(&inner));
        assert!(!image.contains(&inner.grown(3, 3)));
        assert_eq!(inner.grown(3, 3).clipped(&image), BBox::new(10, 20, 33, 43));
        assert!(BBox::new(0, 0, 5, 5).clipped(&image).is_empty());
    }

    #[test]
    fn test_ellipse_pixel_bbox() {
        let ellipse = Ellipse::new(EllipseAxes::circle(2.0), Point2::new(10.0, 10.0));
        assert_eq!(ellipse.pixel_bbox(), BBox::new(8, 8, 12, 12));
        assert!(ellipse.contains(12.0, 10.0));
        assert!(!ellipse.contains(12.0, 11.0));
    }

    #[test]
    fn test_affine_apply() {
        let t = AffineTransform::new([2.0, 0.0, 0.0, 3.0, 1.0, -1.0]);
        let p = t.apply(Point2::new(1.0, 2.0));
        assert_eq!(p, Point2::new(3.0, 5.0));
        assert_eq!(AffineTransform::identity().apply(p), p);
    }
}
