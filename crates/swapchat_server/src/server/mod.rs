#![forbid(unsafe_code)]

pub mod chat;
pub mod connection;
pub mod core;
pub mod events;
pub mod health;
pub mod lanes;
pub mod lifecycle;
pub mod presence;
pub mod router;
pub mod session;
pub mod store;
pub mod store_sql;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod presence_tests;

#[cfg(test)]
mod lifecycle_tests;



#[cfg(test)]
mod store_tests;

#[cfg(test)]
mod quic_delivery_tests;
