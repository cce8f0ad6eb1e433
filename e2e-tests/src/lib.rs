mod opts;

pub use opts::Opts;
