//! Concrete completion provider implementations

pub mod openai;
