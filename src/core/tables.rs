//! Read-only tax, benefit and RRIF figures.
//!
//! The engine never reaches for a global table: a [`TaxDataProvider`] is passed
//! into the projection entry point and consulted once, before the first
//! simulated year, to build a [`TaxTables`] snapshot. Later years index the
//! snapshot forward by the scenario's inflation assumption.

use serde::Serialize;

use super::error::TaxDataError;
use super::types::Region;

/// A bracket starts at `threshold` and taxes income above it at `rate` until
/// the next bracket's threshold.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxBracket {
    pub threshold: f64,
    pub rate: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditDefinitions {
    pub basic_personal_amount: f64,
    pub age_amount: f64,
    pub age_amount_threshold: f64,
    pub age_amount_reduction_rate: f64,
    pub pension_income_amount: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JurisdictionSchedule {
    pub brackets: Vec<TaxBracket>,
    pub credits: CreditDefinitions,
}

impl JurisdictionSchedule {
    /// Rate at which non-refundable credits are valued.
    pub fn lowest_rate(&self) -> f64 {
        self.brackets.first().map(|b| b.rate).unwrap_or(0.0)
    }

    /// Dollar thresholds and credit amounts scaled by `factor`; rates unchanged.
    pub fn indexed(&self, factor: f64) -> Self {
        Self {
            brackets: self
                .brackets
                .iter()
                .map(|b| TaxBracket {
                    threshold: b.threshold * factor,
                    rate: b.rate,
                })
                .collect(),
            credits: CreditDefinitions {
                basic_personal_amount: self.credits.basic_personal_amount * factor,
                age_amount: self.credits.age_amount * factor,
                age_amount_threshold: self.credits.age_amount_threshold * factor,
                age_amount_reduction_rate: self.credits.age_amount_reduction_rate,
                pension_income_amount: self.credits.pension_income_amount,
            },
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClawbackThresholds {
    pub lower: f64,
    pub upper: f64,
    pub rate: f64,
}

impl ClawbackThresholds {
    pub fn indexed(&self, factor: f64) -> Self {
        Self {
            lower: self.lower * factor,
            upper: self.upper * factor,
            rate: self.rate,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BenefitAmounts {
    /// Maximum annual CPP retirement pension starting at the reference age.
    pub cpp_max_at_reference: f64,
    /// Full annual OAS pension starting at the reference age.
    pub oas_full_at_reference: f64,
    pub reference_age: u32,
    /// Age credit and pension credit eligibility; also the earliest OAS age.
    pub eligibility_age: u32,
    /// Age from which OAS is paid with `oas_senior_increase` added.
    pub oas_senior_increase_age: u32,
    pub oas_senior_increase: f64,
    pub oas_clawback: ClawbackThresholds,
}

/// Age-indexed RRIF minimum withdrawal factors. Not year dependent.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RrifSchedule {
    pub conversion_age: u32,
    pub factors: Vec<(u32, f64)>,
    pub terminal_age: u32,
    pub terminal_rate: f64,
}

pub trait TaxDataProvider {
    fn latest_year(&self) -> u32;
    fn federal_schedule(&self, year: u32) -> Result<JurisdictionSchedule, TaxDataError>;
    fn regional_schedule(
        &self,
        region: Region,
        year: u32,
    ) -> Result<JurisdictionSchedule, TaxDataError>;
    fn benefit_amounts(&self, year: u32) -> Result<BenefitAmounts, TaxDataError>;
    fn capital_gains_inclusion(&self, year: u32) -> Result<f64, TaxDataError>;
    fn rrif_schedule(&self) -> Result<RrifSchedule, TaxDataError>;
}

/// Everything a run needs from the provider, fetched once.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxTables {
    pub base_year: u32,
    pub region: Region,
    pub federal: JurisdictionSchedule,
    pub regional: JurisdictionSchedule,
    pub benefits: BenefitAmounts,
    pub capital_gains_inclusion: f64,
    pub rrif: RrifSchedule,
}

impl TaxTables {
    pub fn load(
        provider: &dyn TaxDataProvider,
        region: Region,
        year: u32,
    ) -> Result<Self, TaxDataError> {
        Ok(Self {
            base_year: year,
            region,
            federal: provider.federal_schedule(year)?,
            regional: provider.regional_schedule(region, year)?,
            benefits: provider.benefit_amounts(year)?,
            capital_gains_inclusion: provider.capital_gains_inclusion(year)?,
            rrif: provider.rrif_schedule()?,
        })
    }
}

const BUNDLED_YEAR: u32 = 2024;

/// Published 2024 federal and provincial figures for the regions it carries.
/// Years after 2024 resolve to the 2024 tables.
#[derive(Copy, Clone, Debug, Default)]
pub struct BundledTaxData;

impl BundledTaxData {
    fn resolve_year(&self, year: u32) -> Result<u32, TaxDataError> {
        if year < BUNDLED_YEAR {
            return Err(TaxDataError::YearUnavailable {
                year,
                earliest: BUNDLED_YEAR,
            });
        }
        Ok(BUNDLED_YEAR)
    }
}

fn brackets(pairs: &[(f64, f64)]) -> Vec<TaxBracket> {
    pairs
        .iter()
        .map(|&(threshold, rate)| TaxBracket { threshold, rate })
        .collect()
}

impl TaxDataProvider for BundledTaxData {
    fn latest_year(&self) -> u32 {
        BUNDLED_YEAR
    }

    fn federal_schedule(&self, year: u32) -> Result<JurisdictionSchedule, TaxDataError> {
        self.resolve_year(year)?;
        Ok(JurisdictionSchedule {
            brackets: brackets(&[
                (0.0, 0.15),
                (55_867.0, 0.205),
                (111_733.0, 0.26),
                (173_205.0, 0.29),
                (246_752.0, 0.33),
            ]),
            credits: CreditDefinitions {
                basic_personal_amount: 15_705.0,
                age_amount: 8_790.0,
                age_amount_threshold: 44_325.0,
                age_amount_reduction_rate: 0.15,
                pension_income_amount: 2_000.0,
            },
        })
    }

    fn regional_schedule(
        &self,
        region: Region,
        year: u32,
    ) -> Result<JurisdictionSchedule, TaxDataError> {
        self.resolve_year(year)?;
        let (pairs, credits): (Vec<(f64, f64)>, CreditDefinitions) = match region {
            Region::On => (
                vec![
                    (0.0, 0.0505),
                    (51_446.0, 0.0915),
                    (102_894.0, 0.1116),
                    (150_000.0, 0.1216),
                    (220_000.0, 0.1316),
                ],
                CreditDefinitions {
                    basic_personal_amount: 12_399.0,
                    age_amount: 6_054.0,
                    age_amount_threshold: 45_068.0,
                    age_amount_reduction_rate: 0.15,
                    pension_income_amount: 1_762.0,
                },
            ),
            Region::Bc => (
                vec![
                    (0.0, 0.0506),
                    (47_937.0, 0.077),
                    (95_875.0, 0.105),
                    (110_076.0, 0.1229),
                    (133_664.0, 0.147),
                    (181_232.0, 0.168),
                    (252_752.0, 0.205),
                ],
                CreditDefinitions {
                    basic_personal_amount: 12_580.0,
                    age_amount: 5_799.0,
                    age_amount_threshold: 43_169.0,
                    age_amount_reduction_rate: 0.15,
                    pension_income_amount: 1_000.0,
                },
            ),
            Region::Ab => (
                vec![
                    (0.0, 0.10),
                    (148_269.0, 0.12),
                    (177_922.0, 0.13),
                    (237_230.0, 0.14),
                    (355_845.0, 0.15),
                ],
                CreditDefinitions {
                    basic_personal_amount: 21_885.0,
                    age_amount: 6_221.0,
                    age_amount_threshold: 46_308.0,
                    age_amount_reduction_rate: 0.15,
                    pension_income_amount: 1_653.0,
                },
            ),
            Region::Sk => (
                vec![(0.0, 0.105), (52_057.0, 0.125), (148_734.0, 0.145)],
                CreditDefinitions {
                    basic_personal_amount: 18_491.0,
                    age_amount: 5_380.0,
                    age_amount_threshold: 40_051.0,
                    age_amount_reduction_rate: 0.15,
                    pension_income_amount: 1_000.0,
                },
            ),
            Region::Mb => (
                vec![(0.0, 0.108), (47_000.0, 0.1275), (100_000.0, 0.174)],
                CreditDefinitions {
                    basic_personal_amount: 15_780.0,
                    age_amount: 3_728.0,
                    age_amount_threshold: 27_749.0,
                    age_amount_reduction_rate: 0.15,
                    pension_income_amount: 1_000.0,
                },
            ),
            Region::Ns => (
                vec![
                    (0.0, 0.0879),
                    (29_590.0, 0.1495),
                    (59_180.0, 0.1667),
                    (93_000.0, 0.175),
                    (150_000.0, 0.21),
                ],
                CreditDefinitions {
                    basic_personal_amount: 8_744.0,
                    age_amount: 4_141.0,
                    age_amount_threshold: 30_828.0,
                    age_amount_reduction_rate: 0.15,
                    pension_income_amount: 1_173.0,
                },
            ),
            other => return Err(TaxDataError::UnknownRegion(other.code().to_string())),
        };

        Ok(JurisdictionSchedule {
            brackets: brackets(&pairs),
            credits,
        })
    }

    fn benefit_amounts(&self, year: u32) -> Result<BenefitAmounts, TaxDataError> {
        self.resolve_year(year)?;
        Ok(BenefitAmounts {
            cpp_max_at_reference: 16_375.20,
            oas_full_at_reference: 8_560.08,
            reference_age: 65,
            eligibility_age: 65,
            oas_senior_increase_age: 75,
            oas_senior_increase: 0.10,
            oas_clawback: ClawbackThresholds {
                lower: 90_997.0,
                upper: 148_451.0,
                rate: 0.15,
            },
        })
    }

    fn capital_gains_inclusion(&self, year: u32) -> Result<f64, TaxDataError> {
        self.resolve_year(year)?;
        Ok(0.5)
    }

    fn rrif_schedule(&self) -> Result<RrifSchedule, TaxDataError> {
        Ok(RrifSchedule {
            conversion_age: 71,
            factors: vec![
                (71, 0.0528),
                (72, 0.0540),
                (73, 0.0553),
                (74, 0.0567),
                (75, 0.0582),
                (76, 0.0598),
                (77, 0.0617),
                (78, 0.0636),
                (79, 0.0658),
                (80, 0.0682),
                (81, 0.0708),
                (82, 0.0738),
                (83, 0.0771),
                (84, 0.0808),
                (85, 0.0851),
                (86, 0.0899),
                (87, 0.0955),
                (88, 0.1021),
                (89, 0.1099),
                (90, 0.1192),
                (91, 0.1306),
                (92, 0.1449),
                (93, 0.1634),
                (94, 0.1879),
            ],
            terminal_age: 95,
            terminal_rate: 0.20,
        })
    }
}
