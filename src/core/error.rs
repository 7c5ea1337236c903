use thiserror::Error;

/// Failures of the tax-data provider. All of them are fatal for a run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaxDataError {
    #[error("no tax tables for region {0}")]
    UnknownRegion(String),
    #[error("no tax tables for {year}; earliest available year is {earliest}")]
    YearUnavailable { year: u32, earliest: u32 },
    #[error("tax data provider unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("invalid scenario: {0}")]
    InvalidScenario(String),
    #[error(transparent)]
    TaxData(#[from] TaxDataError),
}
