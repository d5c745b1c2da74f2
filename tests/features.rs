use approx::assert_abs_diff_eq;
use polars::prelude::*;

use bcrisk::dataset::{f64_values, str_values};
use bcrisk::features::{
    factorize, grouped_sample_std, winsorize, with_factorized, with_group_lag, with_winsorized,
};

#[test]
fn factorize_codes_levels_in_order_of_appearance() {
    let values = vec![Some("b"), Some("a"), Some("b"), None, Some("c")];
    assert_eq!(
        factorize(&values),
        vec![Some(0), Some(1), Some(0), None, Some(2)]
    );
}

#[test]
fn lag_does_not_cross_group_boundaries() -> anyhow::Result<()> {
    let frame = df! {
        "firm" => &[Some("A"), Some("A"), Some("B"), None, Some("B"), None],
        "value" => &[Some(1.0), Some(2.0), Some(3.0), Some(4.0), Some(5.0), Some(6.0)],
    }?;

    let lagged = with_group_lag(&frame, "firm", "value", "value_lag")?;
    assert_eq!(
        f64_values(&lagged, "value_lag")?,
        vec![None, Some(1.0), None, None, Some(3.0), None]
    );
    Ok(())
}

#[test]
fn lag_propagates_missing_values() -> anyhow::Result<()> {
    let frame = df! {
        "firm" => &[1_i64, 1, 1],
        "value" => &[Some(1.0), None, Some(3.0)],
    }?;

    let lagged = with_group_lag(&frame, "firm", "value", "value_lag")?;
    assert_eq!(f64_values(&lagged, "value_lag")?, vec![None, Some(1.0), None]);
    Ok(())
}

#[test]
fn winsorize_clips_tails_to_neighbouring_order_statistics() {
    let mut values = vec![7.0, 1.0, 10.0, 4.0, 2.0, 9.0, 3.0, 6.0, 8.0, 5.0];
    winsorize(&mut values, 0.1, 0.1);
    assert_eq!(values, vec![7.0, 2.0, 9.0, 4.0, 2.0, 9.0, 3.0, 6.0, 8.0, 5.0]);
}

#[test]
fn winsorize_leaves_small_samples_untouched() {
    let mut values = vec![100.0, -50.0, 3.0];
    winsorize(&mut values, 0.01, 0.01);
    assert_eq!(values, vec![100.0, -50.0, 3.0]);
}

#[test]
fn winsorize_percentile_tails_of_a_hundred_values() {
    let mut values: Vec<f64> = (0..100).rev().map(f64::from).collect();
    winsorize(&mut values, 0.01, 0.01);
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    assert_eq!(min, 1.0);
    assert_eq!(max, 98.0);
    assert_eq!(values[50], 49.0);
}

#[test]
fn grouped_std_skips_single_observation_groups() -> anyhow::Result<()> {
    let frame = df! {
        "firm" => &[Some("c"), Some("a"), Some("b"), Some("c"), Some("a"), Some("c"), None, None],
        "value" => &[2.0, 1.0, 5.0, 4.0, 3.0, 6.0, 0.0, 10.0],
    }?;
    let result = grouped_sample_std(&frame, &["firm"], "value", "vol")?;

    assert_eq!(
        str_values(&result, "firm")?,
        vec![Some("a".to_string()), Some("c".to_string())]
    );
    let vol = f64_values(&result, "vol")?;
    assert_abs_diff_eq!(vol[0].unwrap_or_default(), 2.0_f64.sqrt(), epsilon = 1e-12);
    assert_abs_diff_eq!(vol[1].unwrap_or_default(), 2.0, epsilon = 1e-12);
    Ok(())
}

#[test]
fn grouped_std_drops_groups_with_infinite_members() -> anyhow::Result<()> {
    let frame = df! {
        "firm" => &["a", "a", "b", "b"],
        "year" => &[2000_i64, 2000, 2000, 2000],
        "value" => &[1.0, f64::INFINITY, 1.0, 2.0],
    }?;
    let result = grouped_sample_std(&frame, &["firm", "year"], "value", "vol")?;

    assert_eq!(str_values(&result, "firm")?, vec![Some("b".to_string())]);
    Ok(())
}

#[test]
fn frame_helpers_append_columns() -> anyhow::Result<()> {
    let frame = df! {
        "firm" => &["x", "x", "x", "y", "y"],
        "assets" => &[Some(10.0), Some(12.0), None, Some(5.0), Some(6.0)],
    }?;

    let coded = with_factorized(&frame, "firm", "firmn")?;
    let lagged = with_group_lag(&coded, "firm", "assets", "assets_lag")?;
    assert_eq!(
        f64_values(&lagged, "assets_lag")?,
        vec![None, Some(10.0), Some(12.0), None, Some(5.0)]
    );
    assert_eq!(
        f64_values(&lagged, "firmn")?,
        vec![Some(0.0), Some(0.0), Some(0.0), Some(1.0), Some(1.0)]
    );

    let clipped = with_winsorized(&lagged, "assets", 0.25, 0.25)?;
    assert_eq!(
        f64_values(&clipped, "assets")?,
        vec![Some(10.0), Some(10.0), None, Some(6.0), Some(6.0)]
    );

    Ok(())
}
