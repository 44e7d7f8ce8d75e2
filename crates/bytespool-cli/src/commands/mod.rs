pub mod check;
pub mod destination;
pub mod run;
