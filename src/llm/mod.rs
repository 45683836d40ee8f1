pub mod gemini;

pub use gemini::{generate_image, generate_text, generate_video, ImageGenerationError};
