pub mod health;
pub mod research;
pub mod stream;
