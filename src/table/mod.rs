//! Table Access (`spec.md` §4.4): the query-shaped surface over the
//! remote database, split into the where-expression/subset AST
//! ([`query`]), the translation and transport layer ([`access`]), and
//! the injected remote-database capability contract ([`remote`]).

pub mod access;
pub mod query;
pub mod remote;
