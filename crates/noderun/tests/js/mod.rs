mod common;
mod controller;
mod core;
mod deref;
mod http;
