use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use approx::assert_abs_diff_eq;
use tempfile::TempDir;

use bcrisk::compustat::{CleaningError, cash_flow_volatility, clean_annual, parse_wrds_date};
use bcrisk::config::PipelineConfig;
use bcrisk::crsp::{annual_stock_volatility, fiscal_year};
use bcrisk::dataset::{f64_values, i64_values, str_values};
use bcrisk::laws::{bc_law_in_force, is_regulated_utility, is_us_state};
use bcrisk::link::load_ccm_link;

fn write_csv(dir: &TempDir, name: &str, contents: &str) -> anyhow::Result<PathBuf> {
    let path = dir.path().join(name);
    fs::write(&path, contents)?;
    Ok(path)
}

const ANNUAL: &str = "\
gvkey,datadate,fyear,at,ch,csho,lt,sale,prcc_f,incorp,sic,state
001001,1990-12-31,1990,100.0,10.0,5.0,50.0,200.0,20.0,DE,3571,CA
001001,1987-12-31,1987,90.0,8.0,5.0,45.0,180.0,18.0,DE,3571,CA
001002,1990-12-31,1990,,10.0,5.0,50.0,200.0,20.0,NY,2834,NY
001003,1990-12-31,1990,-5.0,10.0,5.0,50.0,200.0,20.0,NY,2834,NY
001004,1990-12-31,1990,100.0,10.0,5.0,50.0,200.0,20.0,NY,4911,NY
001005,1990-12-31,1990,100.0,10.0,5.0,50.0,200.0,20.0,DE,2834,ON
001006,1990-12-31,1990,100.0,0.0,5.0,50.0,200.0,20.0,DE,2834,NY
001007,1976-03-31,1975,100.0,10.0,5.0,50.0,200.0,20.0,DE,2834,NY
001008,1995-12-31,1995,100.0,10.0,,50.0,200.0,20.0,NY,2834,NY
001009,1992-12-31,1992,40.0,4.0,2.0,20.0,60.0,7.5,TX,2834,TX
";

#[test]
fn annual_cleaning_keeps_eligible_firm_years() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = write_csv(&dir, "annual.csv", ANNUAL)?;

    let frame = clean_annual(&path, &PipelineConfig::default())?;
    assert_eq!(frame.height(), 4);

    // Identifiers are read as text, so leading zeros survive.
    assert_eq!(
        str_values(&frame, "gvkey")?,
        vec![
            Some("001001".to_string()),
            Some("001001".to_string()),
            Some("001007".to_string()),
            Some("001009".to_string())
        ]
    );
    assert_eq!(
        i64_values(&frame, "gvkeyn")?,
        vec![Some(0), Some(0), Some(1), Some(2)]
    );
    assert_eq!(
        i64_values(&frame, "staten")?,
        vec![Some(0), Some(0), Some(1), Some(2)]
    );
    assert_eq!(
        i64_values(&frame, "incorpn")?,
        vec![Some(0), Some(0), Some(0), Some(1)]
    );
    assert_eq!(
        i64_values(&frame, "styear")?,
        vec![Some(1990), Some(1987), Some(11_975), Some(21_992)]
    );
    assert_eq!(
        i64_values(&frame, "sicyear")?,
        vec![
            Some(35_711_990),
            Some(35_711_987),
            Some(28_341_975),
            Some(28_341_992)
        ]
    );
    assert_eq!(i64_values(&frame, "bc")?, vec![Some(1), Some(0), Some(0), Some(0)]);

    let log_ch = f64_values(&frame, "log_ch")?;
    assert_abs_diff_eq!(log_ch[0].unwrap_or_default(), 10.0_f64.ln(), epsilon = 1e-12);
    assert_abs_diff_eq!(log_ch[3].unwrap_or_default(), 4.0_f64.ln(), epsilon = 1e-12);

    Ok(())
}

#[test]
fn annual_window_is_configurable() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = write_csv(&dir, "annual.csv", ANNUAL)?;

    let config = PipelineConfig {
        first_fiscal_year: Some(1988),
        last_fiscal_year: None,
        ..PipelineConfig::default()
    };
    let frame = clean_annual(&path, &config)?;
    assert_eq!(i64_values(&frame, "fyear")?, vec![Some(1990), Some(1992)]);

    Ok(())
}

#[test]
fn annual_fiscal_years_parse_from_decimal_exports() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = write_csv(
        &dir,
        "annual.csv",
        "gvkey,datadate,fyear,at,ch,csho,lt,sale,prcc_f,incorp,sic,state\n\
         001001,1990-12-31,1990.0,100.0,10.0,5.0,50.0,200.0,20.0,DE,3571.0,CA\n",
    )?;

    let frame = clean_annual(&path, &PipelineConfig::default())?;
    assert_eq!(i64_values(&frame, "fyear")?, vec![Some(1990)]);
    assert_eq!(i64_values(&frame, "sicyear")?, vec![Some(35_711_990)]);

    Ok(())
}

const QUARTERLY: &str = "\
GVKEY,DATADATE,FYEARQ,OIADPQ,ATQ,ACTQ,CHEQ,DLCQ,DPQ,LCTQ
10,2000-09-30,2000,9.0,120.0,53.0,11.0,6.0,3.0,21.0
10,2000-03-31,2000,10.0,100.0,50.0,10.0,5.0,2.0,20.0
20,2000-06-30,2000,4.0,40.0,20.0,4.0,2.0,1.0,8.0
10,2001-03-31,2001,11.0,135.0,62.0,15.0,7.0,3.0,26.0
10,2000-12-31,2000,15.0,130.0,60.0,15.0,7.0,3.0,25.0
20,2000-03-31,2000,3.0,38.0,19.0,4.0,2.0,1.0,8.0
10,2000-06-30,2000,12.0,110.0,55.0,12.0,6.0,2.0,22.0
";

#[test]
fn cash_flow_volatility_uses_lagged_assets_after_accrual_filter() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = write_csv(&dir, "quarterly.csv", QUARTERLY)?;

    let frame = cash_flow_volatility(&path, &PipelineConfig::default())?;

    // Firm 10: accruals are 0, -3, -3 for Q2..Q4 2000. Q2 loses its asset lag once Q1 is
    // dropped, leaving ratios 12/110 and 18/120. Fiscal 2001 has a single quarter and firm
    // 20 never gets a lagged asset base.
    assert_eq!(frame.height(), 1);
    assert_eq!(str_values(&frame, "gvkey")?, vec![Some("10".to_string())]);
    assert_eq!(i64_values(&frame, "fyear")?, vec![Some(2000)]);

    let expected = (12.0_f64 / 110.0 - 18.0 / 120.0).abs() / 2.0_f64.sqrt();
    let vol = f64_values(&frame, "cash_flow_vol")?;
    assert_abs_diff_eq!(vol[0].unwrap_or_default(), expected, epsilon = 1e-12);

    Ok(())
}

fn sample_std(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
}

/// One firm over 1980-2005 with constant working capital and no depreciation, so each
/// quarter's ratio is `oiadpq / atq_lag`. Operating income cycles 1, 2, 3, 4 through the
/// year. Assets are 100 except for a zero at the end of 1992, which makes the first 1993
/// ratio infinite. The second quarter of 1995 is a large loss.
fn long_quarterly_panel() -> anyhow::Result<String> {
    let mut csv = String::from("gvkey,datadate,fyearq,oiadpq,atq,actq,cheq,dlcq,dpq,lctq\n");
    for year in 1980..=2005 {
        for (quarter, month_end) in ["03-31", "06-30", "09-30", "12-31"].iter().enumerate() {
            let income = if year == 1995 && quarter == 1 {
                -50.0
            } else {
                (quarter + 1) as f64
            };
            let assets = if year == 1992 && quarter == 3 { 0.0 } else { 100.0 };
            writeln!(
                csv,
                "7,{year}-{month_end},{year},{income},{assets},50.0,10.0,5.0,0.0,20.0"
            )?;
        }
    }
    Ok(csv)
}

#[test]
fn cash_flow_volatility_winsorizes_infinite_and_extreme_ratios() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = write_csv(&dir, "quarterly.csv", &long_quarterly_panel()?)?;

    let frame = cash_flow_volatility(&path, &PipelineConfig::default())?;

    // 104 quarters lose two to the accrual and asset lags. With 102 ratios the 1% tails
    // clip one value each: the infinite ratio falls to 0.04 and the loss rises to 0.01.
    assert_eq!(frame.height(), 26);
    let years = i64_values(&frame, "fyear")?;
    let vol = f64_values(&frame, "cash_flow_vol")?;
    let vol_in = |year: i64| {
        years
            .iter()
            .position(|candidate| *candidate == Some(year))
            .and_then(|idx| vol[idx])
            .unwrap_or_default()
    };

    assert_abs_diff_eq!(vol_in(1980), sample_std(&[0.03, 0.04]), epsilon = 1e-12);
    assert_abs_diff_eq!(vol_in(1990), sample_std(&[0.01, 0.02, 0.03, 0.04]), epsilon = 1e-12);
    assert_abs_diff_eq!(vol_in(1993), sample_std(&[0.04, 0.02, 0.03, 0.04]), epsilon = 1e-12);
    assert_abs_diff_eq!(vol_in(1995), sample_std(&[0.01, 0.01, 0.03, 0.04]), epsilon = 1e-12);

    Ok(())
}

#[test]
fn unparsable_dates_are_treated_as_missing() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = write_csv(
        &dir,
        "crsp.csv",
        "date,PERMCO,RET\n19900702,500,0.01\nnot a date,500,0.50\n19900703,500,0.02\n",
    )?;

    let frame = annual_stock_volatility(&path, &PipelineConfig::default())?;
    let vol = f64_values(&frame, "stock_vol")?;
    assert_eq!(frame.height(), 1);
    assert_abs_diff_eq!(
        vol[0].unwrap_or_default(),
        126.0 * 0.0005_f64.sqrt(),
        epsilon = 1e-10
    );

    Ok(())
}

#[test]
fn late_return_codes_do_not_abort_the_load() -> anyhow::Result<()> {
    let mut csv = String::from("date,PERMCO,RET\n");
    for _ in 0..10_500 {
        csv.push_str("1990-07-02,900,0.01\n");
    }
    csv.push_str("1990-08-02,900,C\n");

    let dir = TempDir::new()?;
    let path = write_csv(&dir, "crsp.csv", &csv)?;

    let frame = annual_stock_volatility(&path, &PipelineConfig::default())?;
    assert_eq!(i64_values(&frame, "permco")?, vec![Some(900)]);
    let vol = f64_values(&frame, "stock_vol")?;
    assert_abs_diff_eq!(
        vol[0].unwrap_or_default(),
        252.0 / 10_500.0 * 1.05_f64.sqrt(),
        epsilon = 1e-12
    );

    Ok(())
}

const CRSP: &str = "\
date,PERMCO,RET
19900702,500,0.01
19900703,500,-0.02
19900704,500,C
19910315,500,0.03
19910715,500,0.05
19920701,600,C
";

#[test]
fn stock_volatility_aggregates_by_fiscal_year() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = write_csv(&dir, "crsp.csv", CRSP)?;

    let frame = annual_stock_volatility(&path, &PipelineConfig::default())?;
    assert_eq!(frame.height(), 2);
    assert_eq!(i64_values(&frame, "permco")?, vec![Some(500), Some(500)]);
    assert_eq!(i64_values(&frame, "fyear")?, vec![Some(1990), Some(1991)]);

    let vol = f64_values(&frame, "stock_vol")?;
    assert_abs_diff_eq!(
        vol[0].unwrap_or_default(),
        84.0 * 0.0014_f64.sqrt(),
        epsilon = 1e-10
    );
    assert_abs_diff_eq!(vol[1].unwrap_or_default(), 12.6, epsilon = 1e-10);

    Ok(())
}

#[test]
fn ccm_link_normalises_column_names() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = write_csv(
        &dir,
        "ccm.csv",
        "GVKEY,LPERMCO,fyear,conm\n001001,500,1990,ACME\n001009,,1992,BETA\n",
    )?;

    let frame = load_ccm_link(&path)?;
    assert_eq!(frame.get_column_names().len(), 3);
    assert_eq!(i64_values(&frame, "lpermco")?, vec![Some(500), None]);

    Ok(())
}

#[test]
fn missing_columns_are_reported() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = write_csv(&dir, "ccm.csv", "gvkey,fyear\n1001,1990\n")?;

    let error = load_ccm_link(&path).expect_err("lpermco is required");
    assert!(matches!(
        error,
        CleaningError::Dataset(bcrisk::DatasetError::MissingColumn(ref name)) if name == "lpermco"
    ));

    Ok(())
}

#[test]
fn dates_and_fiscal_years() -> anyhow::Result<()> {
    let iso = parse_wrds_date("date", "1990-06-30")?;
    let compact = parse_wrds_date("date", "19900701")?;
    let us = parse_wrds_date("date", "07/01/1990")?;
    assert_eq!(compact, us);
    assert_eq!(fiscal_year(iso), 1989);
    assert_eq!(fiscal_year(compact), 1990);
    assert!(parse_wrds_date("date", "June 1990").is_err());
    Ok(())
}

#[test]
fn law_tables() {
    assert_eq!(bc_law_in_force("DE", 1987), 0);
    assert_eq!(bc_law_in_force("DE", 1988), 1);
    assert_eq!(bc_law_in_force("NY", 1985), 1);
    assert_eq!(bc_law_in_force("TX", 2000), 0);
    assert!(is_us_state("DC"));
    assert!(!is_us_state("ON"));
    assert!(is_regulated_utility(4911.0));
    assert!(!is_regulated_utility(5000.0));
}
