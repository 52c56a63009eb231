pub mod extractor;
pub mod frame;
pub mod process;
pub mod slideshow;

pub use extractor::{Delimiters, FrameExtractor, FrameReader};
pub use frame::Frame;
pub use frame::PixelFormat;
pub use process::{CaptureCommand, CaptureProcess};
pub use slideshow::Slideshow;
