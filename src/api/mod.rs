//! Definition of the GraphQL API.

use juniper::EmptySubscription;

use self::{
    mutation::Mutation,
    query::Query,
};

pub(crate) mod err;
pub(crate) mod model;

mod context;
mod mutation;
mod query;

pub(crate) use self::context::{Context, RequestMeta};


/// Creates and returns the API root node.
pub(crate) fn root_node() -> RootNode {
    RootNode::new(Query, Mutation, EmptySubscription::new())
}

/// Type of our API root node.
pub(crate) type RootNode = juniper::RootNode<'static, Query, Mutation, EmptySubscription<Context>>;
