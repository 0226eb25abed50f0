//! Email-security gateway event collectors.

pub mod fireeye_etp;
pub mod trend_micro;

pub use fireeye_etp::{FireEyeEtpConfig, FireEyeEtpIntegration};
pub use trend_micro::{TrendMicroConfig, TrendMicroIntegration};
