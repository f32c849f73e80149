//! The GraphQL types of our API and the database operations behind them.
//!
//! Every database operation runs in its own span named `<Model>.<action>`
//! with `db.model` and `db.action` fields, so exported traces show which
//! query a resolver triggered.

pub(crate) mod comment;
pub(crate) mod post;
pub(crate) mod user;


#[derive(Debug, Clone, Copy, PartialEq, Eq, juniper::GraphQLEnum)]
pub(crate) enum SortOrder {
    #[graphql(name = "asc")]
    Asc,
    #[graphql(name = "desc")]
    Desc,
}

impl SortOrder {
    pub(crate) fn to_sql(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, juniper::GraphQLInputObject)]
pub(crate) struct PostOrderByUpdatedAtInput {
    pub(crate) updated_at: SortOrder,
}

/// Identifies a user by ID and/or email. If both are given, both have to
/// match.
#[derive(Debug, Clone, Default, juniper::GraphQLInputObject)]
pub(crate) struct UserUniqueInput {
    pub(crate) id: Option<i32>,
    pub(crate) email: Option<String>,
}

#[derive(Debug, Clone, juniper::GraphQLInputObject)]
pub(crate) struct PostCreateInput {
    pub(crate) title: String,
    pub(crate) content: Option<String>,
}

#[derive(Debug, Clone, juniper::GraphQLInputObject)]
pub(crate) struct CommentCreateInput {
    pub(crate) comment: String,
}

#[derive(Debug, Clone, juniper::GraphQLInputObject)]
pub(crate) struct UserCreateInput {
    pub(crate) email: String,
    pub(crate) name: Option<String>,
    /// Posts that are created together with the user.
    pub(crate) posts: Option<Vec<PostCreateInput>>,
}
