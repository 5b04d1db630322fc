pub mod checker;

pub use checker::{Checker, CheckerHooks, DefaultHooks};
