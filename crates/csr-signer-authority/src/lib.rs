//! Certificate authority enrollment for the CSR signer
//!
//! [`AuthorityClient`] is the protocol capability chosen at startup: EJBCA REST
//! PKCS#10 enrollment or EST. Both produce the same output, a PEM chain with
//! the issued certificate first.

#![deny(missing_docs)]

pub mod client;
pub mod est;
pub mod pkcs7;
pub mod request;
pub mod rest;

pub use client::AuthorityClient;
pub use est::{EstApi, EstEnrollment, EstHttpClient};
pub use request::{parse_request, pem_chain, ParsedRequest};
pub use rest::{
    EjbcaRestClient, EnrollmentDefaults, EnrollmentResponse, Pkcs10Enrollment, Pkcs10Enroller,
    RestEnrollment,
};
