// builder-listener: the build worker's message loop.
// Depends on `builder-sdk` and `builder-common`.
//
// Architecture:
//   main → runner::execute_command → Runner::run_async
//   BrokerConnection → MessageListener → KeepaliveResponder
//                                      → JobDispatcher → WorkerPool → BuildRunner → EventPublisher

pub mod broker;
pub mod build_runner;
pub mod command_settings;
pub mod error_throttler;
pub mod event_publisher;
pub mod job;
pub mod job_dispatcher;
pub mod keepalive;
pub mod message_listener;
pub mod runner;
pub mod worker_pool;
pub mod workspace;

#[cfg(test)]
pub(crate) mod test_support;
