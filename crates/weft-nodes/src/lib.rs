pub mod builtin;
pub mod native;
pub mod registry;
pub mod tokenizer;

pub use native::FsNativeApi;
pub use registry::NodeRegistry;
pub use tokenizer::TiktokenTokenizer;
