use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use kron_photometry::integrator::{ApertureFlux, ApertureIntegrator, SubpixelIntegrator};
use kron_photometry::{
    AffineTransform, Ellipse, EllipseAxes, Exposure, KronError, KronFlux, KronFluxConfig, KronRecord,
    MaskedImage, Point2, SourceRecord,
};

/// Add an elliptical Gaussian of total `flux`, sampled at pixel centres
fn add_gaussian(image: &mut MaskedImage, center: Point2, axes: EllipseAxes, flux: f64) {
    let (sin_t, cos_t) = axes.theta.sin_cos();
    let norm = flux / (2.0 * PI * axes.a * axes.b);
    for y in 0..image.height() as i32 {
        for x in 0..image.width() as i32 {
            let (dx, dy) = (x as f64 - center.x, y as f64 - center.y);
            let u = dx * cos_t + dy * sin_t;
            let v = -dx * sin_t + dy * cos_t;
            let r2 = (u / axes.a).powi(2) + (v / axes.b).powi(2);
            image.add(x, y, norm * (-0.5 * r2).exp());
        }
    }
}

fn blank(size: usize) -> MaskedImage {
    let mut image = MaskedImage::new(size, size);
    for y in 0..size as i32 {
        for x in 0..size as i32 {
            image.set(x, y, 0.0, 1.0);
        }
    }
    image
}

fn config() -> KronFluxConfig {
    KronFluxConfig {
        minimum_radius: 0.5,
        ..Default::default()
    }
}

fn star(size: usize, center: Point2, axes: EllipseAxes, flux: f64) -> (Exposure, SourceRecord) {
    let mut image = blank(size);
    add_gaussian(&mut image, center, axes, flux);
    (Exposure::new(image), SourceRecord::new(1, center).with_shape(axes))
}

/// Counts calls to the wrapped sub-pixel integrator
#[derive(Clone)]
struct CountingIntegrator {
    calls: Arc<AtomicUsize>,
}

impl ApertureIntegrator for CountingIntegrator {
    fn integrate(&self, image: &MaskedImage, aperture: &Ellipse) -> kron_photometry::Result<ApertureFlux> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        SubpixelIntegrator::default().integrate(image, aperture)
    }
}

#[test]
fn test_radius_independent_of_orientation() {
    let center = Point2::new(60.3, 59.6);
    // sqrt(pi/2) * sqrt(a b) for an untruncated Gaussian
    let expected = (PI / 2.0).sqrt() * (3.0f64 * 1.5).sqrt();

    let radii: Vec<f64> = [0.0, 0.5, 1.2, -0.9]
        .iter()
        .map(|&theta| {
            let (exposure, source) = star(121, center, EllipseAxes::new(3.0, 1.5, theta), 1000.0);
            let mut record = KronRecord::new(1);
            KronFlux::new(config())
                .unwrap()
                .measure(&exposure, &source, center, &mut record)
                .unwrap();
            assert!(!record.flags.failure);
            record.radius
        })
        .collect();

    for r in &radii {
        assert!((r / expected - 1.0).abs() < 0.03, "radius {r}, expected {expected}");
        assert!((r / radii[0] - 1.0).abs() < 0.02, "radii {radii:?}");
    }
}

#[test]
fn test_measurement_is_repeatable() {
    let center = Point2::new(40.0, 40.0);
    let (exposure, source) = star(81, center, EllipseAxes::circle(2.0), 500.0);
    let kron = KronFlux::new(config()).unwrap();

    let mut first = KronRecord::new(1);
    let mut second = KronRecord::new(1);
    kron.measure(&exposure, &source, center, &mut first).unwrap();
    kron.measure(&exposure, &source, center, &mut second).unwrap();
    assert_eq!(first, second);
    assert!(first.flux.is_finite() && first.flux_err > 0.0);
}

#[test]
fn test_minimum_radius_floor() {
    let center = Point2::new(40.0, 40.0);
    let (exposure, source) = star(81, center, EllipseAxes::circle(2.0), 500.0);

    let mut free = KronRecord::new(1);
    KronFlux::new(config())
        .unwrap()
        .measure(&exposure, &source, center, &mut free)
        .unwrap();
    assert!(!free.flags.small_radius);
    assert!(free.radius < 5.0);

    let mut floored = KronRecord::new(1);
    KronFlux::new(KronFluxConfig {
        minimum_radius: 5.0,
        ..config()
    })
    .unwrap()
    .measure(&exposure, &source, center, &mut floored)
    .unwrap();
    assert!((floored.radius - 5.0).abs() < 1e-9);
    assert!(floored.flags.small_radius);
    assert!(floored.flags.used_minimum_radius);
    assert!(!floored.flags.failure);
    // A bigger aperture on a positive image holds more flux
    assert!(floored.flux >= free.flux);
}

#[test]
fn test_integration_strategy_boundary() {
    let center = Point2::new(40.0, 40.0);
    let (exposure, source) = star(81, center, EllipseAxes::circle(2.0), 500.0);

    let mut reference = KronRecord::new(1);
    KronFlux::new(config())
        .unwrap()
        .measure(&exposure, &source, center, &mut reference)
        .unwrap();
    let b_flux = 2.5 * reference.radius;

    let run = |max_sinc_radius: f64| {
        let calls = Arc::new(AtomicUsize::new(0));
        let kron = KronFlux::with_integrator(
            KronFluxConfig {
                max_sinc_radius,
                ..config()
            },
            CountingIntegrator {
                calls: calls.clone(),
            },
        )
        .unwrap();
        let mut record = KronRecord::new(1);
        kron.measure(&exposure, &source, center, &mut record).unwrap();
        (calls.load(Ordering::SeqCst), record.flux)
    };

    let (calls_small, flux_summed) = run(b_flux - 1e-6);
    let (calls_large, flux_integrated) = run(b_flux + 1e-6);
    assert_eq!(calls_small, 0);
    assert_eq!(calls_large, 1);
    assert!((flux_summed / flux_integrated - 1.0).abs() < 0.05);
}

#[test]
fn test_forced_matches_reference_under_shift() {
    let axes = EllipseAxes::new(2.5, 1.8, 0.4);
    let ref_center = Point2::new(50.2, 49.7);
    let (ref_exposure, reference) = star(101, ref_center, axes, 800.0);
    let kron = KronFlux::new(config()).unwrap();

    let mut ref_record = KronRecord::new(1);
    kron.measure(&ref_exposure, &reference, ref_center, &mut ref_record)
        .unwrap();

    // The same star, 5 pixels right and 3 pixels down
    let shift = AffineTransform::new([1.0, 0.0, 0.0, 1.0, 5.0, -3.0]);
    let meas_center = shift.apply(ref_center);
    let (meas_exposure, _) = star(101, meas_center, axes, 800.0);

    let mut forced = KronRecord::new(1);
    kron.measure_forced(
        &meas_exposure,
        meas_center,
        &reference,
        &ref_record,
        &shift,
        &mut forced,
    )
    .unwrap();
    assert!(!forced.flags.failure);
    assert!((forced.radius / ref_record.radius - 1.0).abs() < 1e-9);
    assert!((forced.flux / ref_record.flux - 1.0).abs() < 1e-6);
}

#[test]
fn test_edge_on_first_iteration() {
    let center = Point2::new(3.0, 3.0);
    let (exposure, source) = star(50, center, EllipseAxes::circle(2.0), 500.0);

    let mut record = KronRecord::new(1);
    let err = KronFlux::new(config())
        .unwrap()
        .measure(&exposure, &source, center, &mut record)
        .unwrap_err();
    assert!(err.is_edge());
    let message = err.to_string();
    assert!(
        message.starts_with("source 1 at (3.000, 3.000): Determining Kron aperture"),
        "{message}"
    );
    assert!(record.flags.edge);
    assert!(record.flags.failure);
    assert!(record.flux.is_nan());
}

#[test]
fn test_huge_shape_is_edge_not_panic() {
    let center = Point2::new(50.0, 50.0);
    let (exposure, good) = star(100, center, EllipseAxes::circle(2.0), 500.0);
    let huge = SourceRecord::new(2, center).with_shape(EllipseAxes::circle(1e9));
    let kron = KronFlux::new(KronFluxConfig {
        minimum_radius: 1.0,
        ..config()
    })
    .unwrap();

    let mut record = KronRecord::new(2);
    let err = kron.measure(&exposure, &huge, center, &mut record).unwrap_err();
    assert!(err.is_edge());
    assert!(record.flags.edge);

    let results = kron.measure_catalog(&exposure, &[huge, good]);
    assert!(results[0].error.as_ref().is_some_and(|e| e.is_edge()));
    assert!(results[1].error.is_none());
    assert!(results[1].record.is_measured());
}

#[test]
fn test_fallback_on_empty_image() {
    let center = Point2::new(30.0, 30.0);
    let exposure = Exposure::new(blank(61));
    let source = SourceRecord::new(1, center).with_shape(EllipseAxes::new(2.7, 1.3, 0.4));

    let mut record = KronRecord::new(1);
    KronFlux::new(KronFluxConfig {
        minimum_radius: 4.0,
        ..config()
    })
    .unwrap()
    .measure(&exposure, &source, center, &mut record)
    .unwrap();
    assert!(record.flags.bad_radius);
    assert!(record.flags.used_minimum_radius);
    // The fallback radius is already the minimum, so it isn't "too small"
    assert!(!record.flags.small_radius);
    // Low signal-to-noise alone isn't a failure
    assert!(!record.flags.failure);
    assert_eq!(record.radius, 4.0);
    assert_eq!(record.flux, 0.0);
}

#[test]
fn test_fallback_radius_is_exactly_the_minimum() {
    let center = Point2::new(60.0, 60.0);
    let exposure = Exposure::new(blank(121));
    for i in 0..50 {
        let minimum_radius = 3.0 + 0.0313 * i as f64;
        let shape = EllipseAxes::new(2.0 + 0.11 * i as f64, 1.1 + 0.017 * i as f64, 0.05 * i as f64);
        let source = SourceRecord::new(i, center).with_shape(shape);
        let mut record = KronRecord::new(i);
        KronFlux::new(KronFluxConfig {
            minimum_radius,
            ..config()
        })
        .unwrap()
        .measure(&exposure, &source, center, &mut record)
        .unwrap();
        assert_eq!(record.radius, minimum_radius);
        assert!(record.flags.bad_radius && record.flags.used_minimum_radius);
        assert!(!record.flags.small_radius, "minimum {minimum_radius}");
    }
}

#[test]
fn test_noisy_field_catalog() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut image = MaskedImage::new(200, 200);
    for y in 0..200 {
        for x in 0..200 {
            image.set(x, y, rng.gen_range(-0.5..0.5), 1.0 / 12.0);
        }
    }

    let positions = [
        (40.3, 40.1),
        (120.6, 50.2),
        (60.0, 140.5),
        (150.4, 150.9),
        (100.2, 99.8),
    ];
    let axes = EllipseAxes::circle(1.8);
    let mut sources = Vec::new();
    for (i, &(x, y)) in positions.iter().enumerate() {
        let center = Point2::new(x, y);
        add_gaussian(&mut image, center, axes, 5000.0);
        sources.push(SourceRecord::new(i as u64, center).with_shape(axes));
    }
    // Too close to the edge to measure
    let edge_center = Point2::new(3.0, 100.0);
    add_gaussian(&mut image, edge_center, axes, 5000.0);
    sources.push(SourceRecord::new(99, edge_center).with_shape(axes));

    let exposure = Exposure::new(image);
    let results = KronFlux::new(config()).unwrap().measure_catalog(&exposure, &sources);
    assert_eq!(results.len(), sources.len());

    for m in &results[..positions.len()] {
        assert!(m.error.is_none(), "{:?}", m.error);
        assert!(m.record.is_measured());
        assert!(
            (m.record.flux / 5000.0 - 1.0).abs() < 0.05,
            "flux {}",
            m.record.flux
        );
        assert!(m.record.flux_err > 0.0);
    }

    let edge = &results[positions.len()];
    assert_eq!(edge.record.id, 99);
    assert!(edge.error.as_ref().is_some_and(|e| e.is_edge()));
    assert!(edge.record.flags.edge);
}

#[test]
fn test_zero_iterations_rejected() {
    let err = KronFlux::new(KronFluxConfig {
        n_iter_for_radius: 0,
        ..config()
    })
    .err()
    .unwrap();
    assert!(matches!(err, KronError::Config(_)));
    assert!(err.to_string().contains("n_iter_for_radius"));
}
