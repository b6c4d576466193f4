//! Speech translation: recognize the source language, translate, synthesize.
//!
//! The pipeline only talks to [`SpeechTranslator`]; [`AzureTranslator`] is the
//! production implementation over the Azure Speech and Translator REST APIs.

pub mod azure;
pub mod client;

pub use azure::{AzureTranslator, SpeechCredentials, SYNTHESIS_SAMPLE_RATE};
pub use client::{SessionId, SpeechTranslator, Translation, TranslationError};

#[cfg(test)]
pub use client::StubTranslator;
