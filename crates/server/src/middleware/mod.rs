mod model_loaders;

pub use model_loaders::{load_image_middleware, load_project_middleware};
