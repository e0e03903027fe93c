pub mod auth;
pub mod dispatcher;
pub mod feeds;
pub mod oauth;
pub mod storage;
pub mod tasks;
pub mod worker;
