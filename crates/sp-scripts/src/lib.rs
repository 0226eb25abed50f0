//! # sp-scripts
//!
//! Automation scripts run by the SOAR host: a condition router, a hunting
//! session launcher and a workshop answer checker.
//!
//! Scripts implement [`Script`] and reach the host through [`HostServices`].

pub mod answer_check;
pub mod hunting_from_indicator;
pub mod if_elif;
pub mod registry;
pub mod testing;

pub use answer_check::AnswerCheck;
pub use hunting_from_indicator::HuntingFromIndicator;
pub use if_elif::{evaluate, load_conditions, ExpressionError, IfElif};
pub use registry::{
    is_error_entry, HostServices, Script, ScriptError, ScriptRegistry, ScriptResult,
};
