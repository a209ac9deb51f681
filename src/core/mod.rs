pub mod animation;
pub mod attributes;
pub mod config;
pub mod events;
pub mod helpers;
pub mod history;
pub mod link;
pub mod navigation;
pub mod plugin;
pub mod render;
pub mod session;
pub mod state;
pub mod template;
pub mod updater;
pub mod validation;
pub mod value;
