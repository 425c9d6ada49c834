pub mod dispatch;
pub mod document;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod ignore;
pub mod metadata;
pub mod orchestrator;
pub mod postprocess;
pub mod profile;
pub mod select;
pub mod settings;
pub mod template;

pub use dispatch::{DownloadDispatcher, DownloadJob, DownloadMethod, JsonLinesDispatcher};
pub use document::Document;
pub use error::{DispatchError, FetchError, RunError, ScrapeError, Stage, TemplateError, ValidationError};
pub use extract::{ExtractedPage, ExtractedRecord};
pub use fetch::{DocumentFetcher, FetchFlags, HttpFetcher};
pub use ignore::IgnoreList;
pub use metadata::CaseRules;
pub use orchestrator::{Orchestrator, RunOptions, RunOutcome, RunStatus};
pub use profile::{match_url, ModeMatch, ProfileSet, SiteProfile};
pub use settings::Settings;
pub use template::Params;
