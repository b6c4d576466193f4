//! Push-to-talk speech translation.
//!
//! Hold a key, speak; the utterance is recognized, translated, synthesized and
//! played into a virtual audio device while an external mixer keeps the
//! synthesized voice out of the live microphone path.

pub mod audio;
pub mod config;
pub mod diagnostics;
pub mod hotkey;
pub mod mixer;
pub mod pipeline;
pub mod translate;
