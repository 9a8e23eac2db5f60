pub mod chunker;
pub mod pipeline;
pub mod sanitizer;
pub mod validator;

pub use pipeline::{AddDocumentRequest, DocHandle, IngestError, IngestOutcome, IngestionPipeline};
pub use sanitizer::{PiiClass, SanitizeOutcome, Sanitizer};
