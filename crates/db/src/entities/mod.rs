pub mod image_generation;
pub mod project;
pub mod transform_run;
