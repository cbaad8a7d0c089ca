//! Outbound relay channels.

pub mod email;
pub mod sms;

pub use email::{EmailTransport, SmtpEmailTransport, UnavailableEmail};
pub use sms::{DeliveryReport, HttpSmsGateway, SmsRequest, SmsTransport, UnavailableSms};
