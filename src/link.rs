use std::path::Path;

use polars::prelude::*;

use crate::compustat::CleaningResult;
use crate::dataset::PanelData;
use crate::logging::log_event;

/// Load the CRSP/Compustat merged annual link, keeping `gvkey`, `lpermco` and `fyear`.
pub fn load_ccm_link<P: AsRef<Path>>(path: P) -> CleaningResult<DataFrame> {
    let frame = PanelData::from_csv(path)?
        .select_as(&[
            ("gvkey", DataType::String),
            ("lpermco", DataType::Int64),
            ("fyear", DataType::Int64),
        ])?
        .collect()?;

    log_event(
        file!(),
        "CcmLink",
        "load_ccm_link",
        "link.load",
        line!(),
        "Loaded gvkey to permco link",
        Some(frame.height()),
        None,
    );

    Ok(frame)
}
