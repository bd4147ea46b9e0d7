mod assert;

pub use assert::hard_assert;
