pub mod twin;
pub mod twin_sequence;
