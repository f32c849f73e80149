use juniper::graphql_object;

use crate::{prelude::*, telemetry::ErrorReporter};
use super::{
    Context,
    err::{ApiError, ApiErrorKind, ApiResult, not_found},
    model::{
        CommentCreateInput,
        PostCreateInput,
        UserCreateInput,
        comment::Comment,
        post::Post,
        user::User,
    },
};


/// The root mutation object.
pub(crate) struct Mutation;

#[graphql_object(Context = Context)]
impl Mutation {
    /// Creates a user together with the given posts.
    async fn signup_user(data: UserCreateInput, context: &Context) -> ApiResult<User> {
        User::create(context.db().await?, data).await
    }

    /// Creates an unpublished post by the user with email `author_email`.
    async fn create_draft(
        data: PostCreateInput,
        author_email: String,
        context: &Context,
    ) -> ApiResult<Option<Post>> {
        Post::create_draft(context.db().await?, data, &author_email).await.map(Some)
    }

    /// Increases the like counter of the given post by one.
    async fn like_post(id: i32, context: &Context) -> ApiResult<Option<Post>> {
        Post::like(context.db().await?, id).await.map(Some)
    }

    /// Sets `published` of the given post. If `published` is omitted, the
    /// current value is flipped.
    async fn toggle_publish_post(
        id: i32,
        published: Option<bool>,
        context: &Context,
    ) -> ApiResult<Option<Post>> {
        let result = match context.db().await {
            Ok(db) => Post::set_published(db, id, published).await
                .map_err(|e| post_not_found(id, e, &context.reporter)),

            // Reported with the whole request already.
            Err(_) => Err(post_not_found_error(id)),
        };
        result.map(Some)
    }

    /// Deletes the given post (including its comments) and returns it.
    async fn delete_post(id: i32, context: &Context) -> ApiResult<Option<Post>> {
        Post::delete(context.db().await?, id).await.map(Some)
    }

    /// Adds a comment to a post.
    async fn add_comment(
        post_id: i32,
        author_email: String,
        data: CommentCreateInput,
        context: &Context,
    ) -> ApiResult<Option<Comment>> {
        Comment::create(context.db().await?, post_id, &author_email, data).await.map(Some)
    }
}

/// Whatever went wrong, clients only learn that the post is not there.
/// Internal errors are reported, as the response does not show them anymore.
fn post_not_found(id: i32, e: ApiError, reporter: &ErrorReporter) -> ApiError {
    if e.kind == ApiErrorKind::InternalServerError {
        reporter.report(&format!("Toggling post {id} failed: {e}"));
    } else {
        debug!("Toggling post {id} failed: {e}");
    }
    post_not_found_error(id)
}

fn post_not_found_error(id: i32) -> ApiError {
    not_found!(key = "post.not-found", "Post with ID {} does not exist", id)
}
