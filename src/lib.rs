// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod broker;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod factory;
pub mod publisher;
pub mod status;
pub mod supervisor;
pub mod target;
