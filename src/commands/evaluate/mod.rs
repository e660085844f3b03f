mod basic;
mod distance;
mod privacy;
mod run;

pub(crate) use run::run;
