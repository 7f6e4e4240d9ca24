pub mod errors;
pub mod gestures;
pub mod models;
pub mod settings;
pub mod stimulation;
pub mod synchronizer;
