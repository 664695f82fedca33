//! Lantern - a peer-to-peer censorship-circumvention overlay node.
//!
//! Every node runs this same software. Nodes form a rooted tree of trusted
//! master nodes (the backbone, typically operated by the network) and user
//! nodes (leaves run by end users, each tied to one email address). A node:
//!
//! - exposes a local HTTP proxy to its own browser and tunnels those
//!   requests over mutually-authenticated TLS to an upstream peer, which
//!   egresses them to the open Internet ([`proxy`])
//! - participates in a tree-structured signaling overlay that routes
//!   presence messages toward whichever leaf can deliver them
//!   ([`signaling`])
//! - bootstraps its trust from a parent certificate delivered out of band,
//!   and obtains its own certificate from its parent by proving ownership
//!   of an email address ([`keystore`], [`certgen`], [`enrollment`],
//!   [`identity`])
//!
//! # Trust
//!
//! Children trust their parents via the out-of-band certificate. Parents
//! initially trust child user nodes via an identity assertion verified with
//! an external verifier; after that first authentication the parent issues
//! the child a certificate whose CN contains the child's email address,
//! encrypted so only the parent can read it. Subsequent connections are
//! authenticated by that certificate alone.
//!
//! # Composition
//!
//! Components are constructed explicitly, in dependency order, by the
//! binary's composition root: configuration, then keys, then the
//! certificate (self-signed for roots, requested from the parent
//! otherwise), then the TLS listeners. The proxies never start accepting
//! before the node holds its leaf certificate.

pub mod certgen;
pub mod config;
pub mod enrollment;
pub mod identity;
pub mod keystore;
pub mod proxy;
pub mod signaling;
pub mod tls;
