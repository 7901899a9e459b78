pub mod cloud_backend;
pub mod cloud_client;
pub mod deploy_repository;
pub mod file_client;
pub mod file_server;
pub mod job_queue;
pub mod local_store;
pub mod memory_backend;
pub mod worker;
