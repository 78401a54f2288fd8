pub mod aggregator;
pub mod calendar;
pub mod init;
pub mod pagerduty;
pub mod poller;
pub mod sensors;

#[cfg(test)]
pub mod testing;
