//! Tests that need a real database. They create a temporary database via
//! `POSTGRAPH_TEST_DATABASE_URL` and are ignored by default. Run them with
//! `cargo test -- --include-ignored`.

use juniper::Variables;

use crate::{
    api::{
        self,
        err::ApiErrorKind,
        model::{
            CommentCreateInput, PostOrderByUpdatedAtInput, SortOrder, UserCreateInput,
            PostCreateInput, comment::Comment, post::{FeedFilter, Post}, user::User,
        },
    },
    prelude::*,
    telemetry::ErrorReporter,
};
use super::MigrationPlan;
use self::util::TestDb;

mod util;


fn ids(posts: &[Post]) -> Vec<i32> {
    posts.iter().map(|p| p.id).collect()
}

fn context(tdb: &TestDb) -> api::Context {
    let meta = api::RequestMeta {
        path: "/graphql".into(),
        request_id: "req-test".into(),
    };
    api::Context::new(tdb.pool().clone(), meta, ErrorReporter::disabled())
}

async fn num_posts(tdb: &TestDb) -> Result<i64> {
    let row = tdb.db().await?.query_one("select count(*) from posts", &[]).await?;
    Ok(row.get(0))
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a database (POSTGRAPH_TEST_DATABASE_URL)"]
async fn migrations_are_up_to_date_afterwards() -> Result<()> {
    let tdb = TestDb::new().await?;

    let mut conn = tdb.pool().get().await?;
    let tx = conn.transaction().await?;
    assert_eq!(MigrationPlan::build(&tx).await?, MigrationPlan::UpToDate);
    tx.rollback().await?;

    // Running them again is a no-op.
    crate::db::migrate(&mut conn).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a database (POSTGRAPH_TEST_DATABASE_URL)"]
async fn feed_search_only_finds_published_posts() -> Result<()> {
    let tdb = TestDb::new().await?;
    let (_, posts) = tdb.add_user("alice@example.org", &[
        ("Rust is fun", true),
        ("Rust drafts", false),
        ("Cooking", true),
    ]).await?;
    let db = tdb.db().await?;

    let filter = FeedFilter::from_args(None, Some("Rust".into()), None, None, None)?;
    assert_eq!(ids(&Post::find_many(&db, &filter).await?), [posts[0].id]);

    // Content is searched as well.
    let filter = FeedFilter::from_args(None, Some("of Cook".into()), None, None, None)?;
    assert_eq!(ids(&Post::find_many(&db, &filter).await?), [posts[2].id]);

    // Case sensitive.
    let filter = FeedFilter::from_args(None, Some("rust".into()), None, None, None)?;
    assert!(Post::find_many(&db, &filter).await?.is_empty());

    let filter = FeedFilter::from_args(Some(false), None, None, None, None)?;
    assert_eq!(ids(&Post::find_many(&db, &filter).await?), [posts[1].id]);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a database (POSTGRAPH_TEST_DATABASE_URL)"]
async fn feed_order_and_pagination() -> Result<()> {
    let tdb = TestDb::new().await?;
    let (_, posts) = tdb.add_user("bob@example.org", &[("a", true), ("b", true), ("c", true)])
        .await?;
    let db = tdb.db().await?;

    let all = FeedFilter::from_args(None, None, None, None, None)?;
    assert_eq!(ids(&Post::find_many(&db, &all).await?), ids(&posts));

    let newest_first = Some(PostOrderByUpdatedAtInput { updated_at: SortOrder::Desc });
    let filter = FeedFilter::from_args(None, None, Some(1), Some(1), newest_first)?;
    assert_eq!(ids(&Post::find_many(&db, &filter).await?), [posts[1].id]);

    let filter = FeedFilter::from_args(None, None, Some(2), None, None)?;
    assert_eq!(ids(&Post::find_many(&db, &filter).await?), [posts[2].id]);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a database (POSTGRAPH_TEST_DATABASE_URL)"]
async fn toggle_publish_flips_and_returns_post() -> Result<()> {
    let tdb = TestDb::new().await?;
    let (_, posts) = tdb.add_user("carol@example.org", &[("draft", false)]).await?;
    let db = tdb.db().await?;

    let post = Post::set_published(&db, posts[0].id, None).await?;
    assert!(post.published);
    assert!(post.updated_at >= posts[0].updated_at);
    let post = Post::set_published(&db, posts[0].id, None).await?;
    assert!(!post.published);

    // An explicit value is not a toggle.
    let post = Post::set_published(&db, posts[0].id, Some(false)).await?;
    assert!(!post.published);

    let err = Post::set_published(&db, 9999, None).await.unwrap_err();
    assert_eq!(err.kind, ApiErrorKind::NotFound);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a database (POSTGRAPH_TEST_DATABASE_URL)"]
async fn likes_add_up() -> Result<()> {
    let tdb = TestDb::new().await?;
    let (_, posts) = tdb.add_user("dave@example.org", &[("popular", true)]).await?;
    let db = tdb.db().await?;

    for _ in 0..5 {
        Post::like(&db, posts[0].id).await?;
    }
    let post = Post::find_by_id(&db, posts[0].id).await?.unwrap();
    assert_eq!(post.likes, posts[0].likes + 5);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a database (POSTGRAPH_TEST_DATABASE_URL)"]
async fn delete_removes_post_and_comments() -> Result<()> {
    let tdb = TestDb::new().await?;
    let (_, posts) = tdb.add_user("erin@example.org", &[("bye", true)]).await?;
    let db = tdb.db().await?;
    Comment::create(&db, posts[0].id, "erin@example.org", CommentCreateInput {
        comment: "first".into(),
    }).await?;

    let deleted = Post::delete(&db, posts[0].id).await?;
    assert_eq!(deleted.title, "bye");
    assert!(Post::find_by_id(&db, posts[0].id).await?.is_none());
    assert!(Comment::find_by_post(&db, posts[0].id).await?.is_empty());

    let err = Post::delete(&db, posts[0].id).await.unwrap_err();
    assert_eq!(err.kind, ApiErrorKind::NotFound);
    assert_eq!(err.key, Some("post.not-found"));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a database (POSTGRAPH_TEST_DATABASE_URL)"]
async fn signup_creates_posts_atomically() -> Result<()> {
    let tdb = TestDb::new().await?;
    let db = tdb.db().await?;
    let input = || UserCreateInput {
        email: "frank@example.org".into(),
        name: Some("Frank".into()),
        posts: Some(vec![
            PostCreateInput { title: "one".into(), content: Some("".into()) },
            PostCreateInput { title: "two".into(), content: Some("2".into()) },
        ]),
    };

    let user = User::create(&db, input()).await?;
    let posts = Post::find_by_author(&db, user.id, None).await?;
    assert_eq!(posts.iter().map(|p| p.title.as_str()).collect::<Vec<_>>(), ["one", "two"]);
    assert_eq!(posts[0].content, None);
    assert!(posts.iter().all(|p| !p.published));

    // Same email again: nothing is created.
    let err = User::create(&db, input()).await.unwrap_err();
    assert_eq!(err.kind, ApiErrorKind::InvalidInput);
    assert_eq!(err.key, Some("user.email-taken"));
    assert_eq!(num_posts(&tdb).await?, 2);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a database (POSTGRAPH_TEST_DATABASE_URL)"]
async fn drafts_and_unique_lookup() -> Result<()> {
    let tdb = TestDb::new().await?;
    let (user, posts) = tdb.add_user("gina@example.org", &[("public", true), ("secret", false)])
        .await?;
    let db = tdb.db().await?;

    let drafts = Post::find_by_author(&db, user.id, Some(false)).await?;
    assert_eq!(ids(&drafts), [posts[1].id]);

    let by_email = api::model::UserUniqueInput { id: None, email: Some(user.email.clone()) };
    assert_eq!(User::find_unique(&db, &by_email).await?.map(|u| u.id), Some(user.id));
    let mismatch = api::model::UserUniqueInput { id: Some(user.id + 1), email: Some(user.email) };
    assert!(User::find_unique(&db, &mismatch).await?.is_none());

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a database (POSTGRAPH_TEST_DATABASE_URL)"]
async fn comment_errors_name_missing_record() -> Result<()> {
    let tdb = TestDb::new().await?;
    let (_, posts) = tdb.add_user("hank@example.org", &[("p", true)]).await?;
    let db = tdb.db().await?;
    let comment = || CommentCreateInput { comment: "hi".into() };

    let err = Comment::create(&db, 9999, "hank@example.org", comment()).await.unwrap_err();
    assert_eq!(err.key, Some("post.not-found"));
    let err = Comment::create(&db, posts[0].id, "nobody@example.org", comment()).await.unwrap_err();
    assert_eq!(err.key, Some("user.not-found"));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a database (POSTGRAPH_TEST_DATABASE_URL)"]
async fn graphql_feed_with_nested_author() -> Result<()> {
    let tdb = TestDb::new().await?;
    tdb.add_user("ivy@example.org", &[("hello world", true)]).await?;

    let ctx = context(&tdb);
    let (data, errors) = juniper::execute(
        r#"{ feed(searchString: "world") { title published author { email } } }"#,
        None,
        &api::root_node(),
        &Variables::new(),
        &ctx,
    ).await.map_err(|e| anyhow!("{e:?}"))?;

    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(data, juniper::graphql_value!({
        "feed": [{
            "title": "hello world",
            "published": true,
            "author": { "email": "ivy@example.org" },
        }],
    }));
    assert!(ctx.num_queries() >= 2);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs a database (POSTGRAPH_TEST_DATABASE_URL)"]
async fn graphql_toggle_of_missing_post() -> Result<()> {
    let tdb = TestDb::new().await?;

    let ctx = context(&tdb);
    let (data, errors) = juniper::execute(
        "mutation { togglePublishPost(id: 9999) { id } }",
        None,
        &api::root_node(),
        &Variables::new(),
        &ctx,
    ).await.map_err(|e| anyhow!("{e:?}"))?;

    assert_eq!(data, juniper::graphql_value!({ "togglePublishPost": null }));
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error().message(), "Post with ID 9999 does not exist");
    assert_eq!(
        errors[0].error().extensions(),
        &juniper::graphql_value!({ "kind": "NOT_FOUND", "key": "post.not-found" }),
    );

    Ok(())
}
