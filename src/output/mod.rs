//! Result output
//!
//! Phase summaries are printed once the run is over, either as a text table
//! ([`text`]) or as a JSON report ([`json`]).

pub mod json;
pub mod text;
