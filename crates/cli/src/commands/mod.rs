pub mod backends;
pub mod links;
pub mod run;
