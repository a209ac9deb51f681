//! Squiffy runtime: plays back compiled interactive-fiction stories.
//!
//! A [`Session`](core::session::Session) renders sections and passages of a
//! compiled [`Story`](schema::story::Story) into an in-memory output tree,
//! tracks persistent attributes, keeps a reversible navigation history and
//! lets plugins extend the template language and link behaviour.

pub mod core;
pub mod plugins;
pub mod schema;

pub use crate::core::session::{Session, SessionBuilder};
pub use crate::schema::story::{Passage, Section, Story};
