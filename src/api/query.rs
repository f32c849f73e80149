use juniper::graphql_object;

use super::{
    Context,
    err::ApiResult,
    model::{
        PostOrderByUpdatedAtInput,
        UserUniqueInput,
        post::{FeedFilter, Post},
        user::User,
    },
};


/// The root query object.
pub(crate) struct Query;

#[graphql_object(Context = Context)]
impl Query {
    /// Returns all users, ordered by ID.
    async fn all_users(context: &Context) -> ApiResult<Vec<User>> {
        User::find_many(context.db().await?).await
    }

    /// Returns the post with the given ID or `null` if it does not exist.
    async fn post_by_id(id: i32, context: &Context) -> ApiResult<Option<Post>> {
        Post::find_by_id(context.db().await?, id).await
    }

    /// Returns posts, by default only published ones. If `searchString` is
    /// given, only posts whose title or content contain it are returned.
    /// `skip` and `take` paginate the result.
    async fn feed(
        published: Option<bool>,
        search_string: Option<String>,
        skip: Option<i32>,
        take: Option<i32>,
        order_by: Option<PostOrderByUpdatedAtInput>,
        context: &Context,
    ) -> ApiResult<Vec<Post>> {
        let filter = FeedFilter::from_args(published, search_string, skip, take, order_by)?;
        Post::find_many(context.db().await?, &filter).await
    }

    /// Returns the unpublished posts of the given user or `null` if that
    /// user does not exist.
    async fn drafts_by_user(
        user_unique_input: UserUniqueInput,
        context: &Context,
    ) -> ApiResult<Option<Vec<Option<Post>>>> {
        let db = context.db().await?;
        let Some(user) = User::find_unique(db, &user_unique_input).await? else {
            return Ok(None);
        };

        let drafts = Post::find_by_author(db, user.id, Some(false)).await?;
        Ok(Some(drafts.into_iter().map(Some).collect()))
    }
}
