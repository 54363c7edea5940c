#![allow(dead_code)]

pub mod config;
pub mod progress;
pub mod report_error;
pub mod util;
