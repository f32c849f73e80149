use chrono::{DateTime, Utc};
use juniper::graphql_object;
use tokio_postgres::Row;

use crate::{
    api::{
        Context,
        err::{ApiResult, internal_server_error, not_found},
        model::{CommentCreateInput, post::Post, user::User},
    },
    db::Db,
    prelude::*,
};


#[derive(Debug, Clone)]
pub(crate) struct Comment {
    pub(crate) id: i32,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) comment: String,
    pub(crate) post_id: i32,
    pub(crate) author_id: i32,
}

#[graphql_object(Context = Context)]
impl Comment {
    fn id(&self) -> i32 {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn comment(&self) -> &str {
        &self.comment
    }

    async fn post(&self, context: &Context) -> ApiResult<Post> {
        Post::find_by_id(context.db().await?, self.post_id).await?.ok_or_else(|| internal_server_error!(
            "post {} of comment {} does not exist",
            self.post_id,
            self.id,
        ))
    }

    async fn author(&self, context: &Context) -> ApiResult<User> {
        User::find_by_id(context.db().await?, self.author_id).await?.ok_or_else(|| internal_server_error!(
            "author {} of comment {} does not exist",
            self.author_id,
            self.id,
        ))
    }
}

impl Comment {
    const COL_NAMES: &'static str = "id, created_at, comment, post_id, author_id";

    fn from_row(row: Row) -> Self {
        Self {
            id: row.get(0),
            created_at: row.get(1),
            comment: row.get(2),
            post_id: row.get(3),
            author_id: row.get(4),
        }
    }

    #[tracing::instrument(
        name = "Comment.findMany",
        skip(db),
        fields(db.model = "Comment", db.action = "findMany"),
    )]
    pub(crate) async fn find_by_post(db: &Db, post_id: i32) -> ApiResult<Vec<Self>> {
        let query = format!(
            "select {} from comments where post_id = $1 order by created_at, id",
            Self::COL_NAMES,
        );
        Ok(db.query_mapped(&query, dbargs![&post_id], Self::from_row).await?)
    }

    #[tracing::instrument(
        name = "Comment.findMany",
        skip(db),
        fields(db.model = "Comment", db.action = "findMany"),
    )]
    pub(crate) async fn find_by_author(db: &Db, author_id: i32) -> ApiResult<Vec<Self>> {
        let query = format!(
            "select {} from comments where author_id = $1 order by created_at, id",
            Self::COL_NAMES,
        );
        Ok(db.query_mapped(&query, dbargs![&author_id], Self::from_row).await?)
    }

    /// Adds a comment to the post `post_id`, written by the user with the
    /// given email.
    #[tracing::instrument(
        name = "Comment.create",
        skip(db, data),
        fields(db.model = "Comment", db.action = "create"),
    )]
    pub(crate) async fn create(
        db: &Db,
        post_id: i32,
        author_email: &str,
        data: CommentCreateInput,
    ) -> ApiResult<Self> {
        let query = format!(
            "insert into comments (comment, post_id, author_id) \
                select $1, posts.id, users.id \
                from posts, users \
                where posts.id = $2 and users.email = $3 \
                returning {}",
            Self::COL_NAMES,
        );
        let row = db.query_opt(&query, &[&data.comment, &post_id, &author_email]).await?;
        if let Some(row) = row {
            return Ok(Self::from_row(row));
        }

        // Nothing was inserted. Find out which of the two is missing to give a
        // helpful error.
        if Post::find_by_id(db, post_id).await?.is_none() {
            Err(not_found!(key = "post.not-found", "Post with ID {} does not exist", post_id))
        } else {
            Err(not_found!(key = "user.not-found", "no user with email '{}' exists", author_email))
        }
    }
}
