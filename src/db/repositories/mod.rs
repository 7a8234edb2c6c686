mod run_sessions;
mod series;

pub(crate) use series::store_run_export;
