#![allow(clippy::useless_conversion)]

pub mod ids;
pub mod image_generation;
pub mod project;
pub mod transform_run;
