use chrono::Utc;
use pgfleet::http::maybe_downsample;
use pgfleet::model::SamplePoint;

// Validate that the downsampling helper reduces large series when over limit.
#[test]
fn history_downsampling_reduces_point_count() {
    let mut points = Vec::new();
    for i in 0..1500 {
        points.push(SamplePoint {
            ts: Utc::now(),
            value: i as f64,
        });
    }
    let (sampled, downsampled) = maybe_downsample(points, 500);
    assert!(downsampled, "expected downsample flag");
    assert!(sampled.len() <= 500, "sampled size <= target");
}

#[test]
fn small_series_pass_through_untouched() {
    let points: Vec<SamplePoint> = (0..10)
        .map(|i| SamplePoint {
            ts: Utc::now(),
            value: i as f64,
        })
        .collect();
    let (sampled, downsampled) = maybe_downsample(points, 500);
    assert!(!downsampled);
    assert_eq!(sampled.len(), 10);
}

#[test]
fn stride_sampling_keeps_the_first_point_and_order() {
    let points: Vec<SamplePoint> = (0..100)
        .map(|i| SamplePoint {
            ts: Utc::now(),
            value: i as f64,
        })
        .collect();
    let (sampled, downsampled) = maybe_downsample(points, 10);
    assert!(downsampled);
    assert!((sampled[0].value - 0.0).abs() < 1e-9, "first point survives");
    for pair in sampled.windows(2) {
        assert!(pair[0].value < pair[1].value, "order preserved");
    }
}
