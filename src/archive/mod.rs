//! Archive validation and extraction

pub mod extractor;
pub mod validator;

pub use extractor::{Extractor, web_path};
pub use validator::validate;
