use chrono::{DateTime, Utc};
use juniper::graphql_object;
use tokio_postgres::Row;

use crate::{
    api::{
        Context,
        err::{ApiError, ApiResult, internal_server_error, invalid_input, not_found},
        model::{PostCreateInput, PostOrderByUpdatedAtInput, SortOrder, comment::Comment, user::User},
    },
    db::Db,
    prelude::*,
};


#[derive(Debug, Clone)]
pub(crate) struct Post {
    pub(crate) id: i32,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    pub(crate) title: String,
    pub(crate) content: Option<String>,
    pub(crate) published: bool,
    pub(crate) likes: i32,
    pub(crate) author_id: i32,
}

#[graphql_object(Context = Context)]
impl Post {
    fn id(&self) -> i32 {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    fn published(&self) -> bool {
        self.published
    }

    fn likes(&self) -> i32 {
        self.likes
    }

    async fn author(&self, context: &Context) -> ApiResult<User> {
        User::find_by_id(context.db().await?, self.author_id).await?.ok_or_else(|| internal_server_error!(
            "author {} of post {} does not exist",
            self.author_id,
            self.id,
        ))
    }

    async fn comments(&self, context: &Context) -> ApiResult<Vec<Comment>> {
        Comment::find_by_post(context.db().await?, self.id).await
    }
}

/// Filter, order and pagination of the `feed` query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FeedFilter {
    pub(crate) published: bool,
    pub(crate) search: Option<String>,
    pub(crate) skip: Option<i64>,
    pub(crate) take: Option<i64>,
    pub(crate) order: Option<SortOrder>,
}

impl FeedFilter {
    /// Converts the GraphQL arguments. `published` defaults to `true`; an
    /// empty search string as well as `0` for `skip` and `take` mean "not
    /// set".
    pub(crate) fn from_args(
        published: Option<bool>,
        search_string: Option<String>,
        skip: Option<i32>,
        take: Option<i32>,
        order_by: Option<PostOrderByUpdatedAtInput>,
    ) -> ApiResult<Self> {
        fn count(name: &str, v: Option<i32>) -> ApiResult<Option<i64>> {
            match v {
                Some(v) if v < 0 => Err(invalid_input!(
                    key = "feed.negative-pagination",
                    "`{}` must not be negative, but is {}",
                    name,
                    v,
                )),
                Some(0) | None => Ok(None),
                Some(v) => Ok(Some(v.into())),
            }
        }

        Ok(Self {
            published: published.unwrap_or(true),
            search: search_string.filter(|s| !s.is_empty()),
            skip: count("skip", skip)?,
            take: count("take", take)?,
            order: order_by.map(|o| o.updated_at),
        })
    }

    /// The SQL query for this filter. Parameters are, in order: `published`,
    /// `search`, `skip` and `take`. `null` for the latter three disables the
    /// respective clause.
    fn sql(&self) -> String {
        let order = match self.order {
            Some(order) => format!("updated_at {}, id", order.to_sql()),
            None => "id".into(),
        };

        format!(
            "select {} from posts \
                where published = $1 \
                and ($2::text is null or strpos(title, $2) > 0 or strpos(content, $2) > 0) \
                order by {order} \
                offset $3 limit $4",
            Post::COL_NAMES,
        )
    }
}

impl Post {
    const COL_NAMES: &'static str
        = "id, created_at, updated_at, title, content, published, likes, author_id";

    fn from_row(row: Row) -> Self {
        Self {
            id: row.get(0),
            created_at: row.get(1),
            updated_at: row.get(2),
            title: row.get(3),
            content: row.get(4),
            published: row.get(5),
            likes: row.get(6),
            author_id: row.get(7),
        }
    }

    fn does_not_exist(id: i32) -> ApiError {
        not_found!(key = "post.not-found", "Post with ID {} does not exist", id)
    }

    #[tracing::instrument(
        name = "Post.findMany",
        skip(db),
        fields(db.model = "Post", db.action = "findMany"),
    )]
    pub(crate) async fn find_many(db: &Db, filter: &FeedFilter) -> ApiResult<Vec<Self>> {
        let posts = db.query_mapped(
            &filter.sql(),
            dbargs![&filter.published, &filter.search, &filter.skip, &filter.take],
            Self::from_row,
        ).await?;
        Ok(posts)
    }

    #[tracing::instrument(
        name = "Post.findUnique",
        skip(db),
        fields(db.model = "Post", db.action = "findUnique"),
    )]
    pub(crate) async fn find_by_id(db: &Db, id: i32) -> ApiResult<Option<Self>> {
        let query = format!("select {} from posts where id = $1", Self::COL_NAMES);
        Ok(db.query_opt(&query, &[&id]).await?.map(Self::from_row))
    }

    /// Posts of one author, optionally only those with the given `published`
    /// value.
    #[tracing::instrument(
        name = "Post.findMany",
        skip(db),
        fields(db.model = "Post", db.action = "findMany"),
    )]
    pub(crate) async fn find_by_author(
        db: &Db,
        author_id: i32,
        published: Option<bool>,
    ) -> ApiResult<Vec<Self>> {
        let query = format!(
            "select {} from posts \
                where author_id = $1 and ($2::boolean is null or published = $2) \
                order by id",
            Self::COL_NAMES,
        );
        let posts = db.query_mapped(&query, dbargs![&author_id, &published], Self::from_row).await?;
        Ok(posts)
    }

    /// Creates an unpublished post for the user with the given email.
    #[tracing::instrument(
        name = "Post.create",
        skip(db, data),
        fields(db.model = "Post", db.action = "create"),
    )]
    pub(crate) async fn create_draft(
        db: &Db,
        data: PostCreateInput,
        author_email: &str,
    ) -> ApiResult<Self> {
        let query = format!(
            "insert into posts (title, content, author_id) \
                select $1, $2, id from users where email = $3 \
                returning {}",
            Self::COL_NAMES,
        );
        db.query_opt(&query, &[&data.title, &data.content, &author_email])
            .await?
            .map(Self::from_row)
            .ok_or_else(|| not_found!(
                key = "user.not-found",
                "no user with email '{}' exists",
                author_email,
            ))
    }

    #[tracing::instrument(
        name = "Post.update",
        skip(db),
        fields(db.model = "Post", db.action = "update"),
    )]
    pub(crate) async fn like(db: &Db, id: i32) -> ApiResult<Self> {
        let query = format!(
            "update posts set likes = likes + 1, updated_at = now() \
                where id = $1 \
                returning {}",
            Self::COL_NAMES,
        );
        db.query_opt(&query, &[&id])
            .await?
            .map(Self::from_row)
            .ok_or_else(|| Self::does_not_exist(id))
    }

    /// Sets `published` to the given value or, if `None`, flips it. Reading
    /// and writing happen in the same statement, so concurrent toggles do
    /// not get lost.
    #[tracing::instrument(
        name = "Post.update",
        skip(db),
        fields(db.model = "Post", db.action = "update"),
    )]
    pub(crate) async fn set_published(
        db: &Db,
        id: i32,
        published: Option<bool>,
    ) -> ApiResult<Self> {
        let query = format!(
            "update posts set published = coalesce($2::boolean, not published), updated_at = now() \
                where id = $1 \
                returning {}",
            Self::COL_NAMES,
        );
        db.query_opt(&query, &[&id, &published])
            .await?
            .map(Self::from_row)
            .ok_or_else(|| Self::does_not_exist(id))
    }

    /// Deletes the post and its comments and returns the deleted post.
    #[tracing::instrument(
        name = "Post.delete",
        skip(db),
        fields(db.model = "Post", db.action = "delete"),
    )]
    pub(crate) async fn delete(db: &Db, id: i32) -> ApiResult<Self> {
        let query = format!("delete from posts where id = $1 returning {}", Self::COL_NAMES);
        db.query_opt(&query, &[&id])
            .await?
            .map(Self::from_row)
            .ok_or_else(|| Self::does_not_exist(id))
    }
}
