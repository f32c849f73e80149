use juniper::graphql_object;
use tokio_postgres::Row;

use crate::{
    api::{
        Context,
        err::{ApiResult, invalid_input, map_db_err},
        model::{UserCreateInput, UserUniqueInput, comment::Comment, post::Post},
    },
    db::Db,
    prelude::*,
};


#[derive(Debug, Clone)]
pub(crate) struct User {
    pub(crate) id: i32,
    pub(crate) name: Option<String>,
    pub(crate) email: String,
}

#[graphql_object(Context = Context)]
impl User {
    fn id(&self) -> i32 {
        self.id
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn email(&self) -> &str {
        &self.email
    }

    /// All posts written by this user, published or not.
    async fn posts(&self, context: &Context) -> ApiResult<Vec<Post>> {
        Post::find_by_author(context.db().await?, self.id, None).await
    }

    async fn comments(&self, context: &Context) -> ApiResult<Vec<Comment>> {
        Comment::find_by_author(context.db().await?, self.id).await
    }
}

impl User {
    const COL_NAMES: &'static str = "id, name, email";

    fn from_row(row: Row) -> Self {
        Self {
            id: row.get(0),
            name: row.get(1),
            email: row.get(2),
        }
    }

    #[tracing::instrument(
        name = "User.findMany",
        skip_all,
        fields(db.model = "User", db.action = "findMany"),
    )]
    pub(crate) async fn find_many(db: &Db) -> ApiResult<Vec<Self>> {
        let query = format!("select {} from users order by id", Self::COL_NAMES);
        let users = db.query_mapped(&query, dbargs![], Self::from_row).await?;
        Ok(users)
    }

    #[tracing::instrument(
        name = "User.findUnique",
        skip(db),
        fields(db.model = "User", db.action = "findUnique"),
    )]
    pub(crate) async fn find_by_id(db: &Db, id: i32) -> ApiResult<Option<Self>> {
        let query = format!("select {} from users where id = $1", Self::COL_NAMES);
        Ok(db.query_opt(&query, &[&id]).await?.map(Self::from_row))
    }

    /// Looks up a user by ID and/or email. `0` and `""` count as "not given".
    #[tracing::instrument(
        name = "User.findUnique",
        skip(db),
        fields(db.model = "User", db.action = "findUnique"),
    )]
    pub(crate) async fn find_unique(db: &Db, input: &UserUniqueInput) -> ApiResult<Option<Self>> {
        let id = input.id.filter(|id| *id != 0);
        let email = input.email.as_deref().filter(|email| !email.is_empty());
        if id.is_none() && email.is_none() {
            return Err(invalid_input!(
                key = "user.unique-input-empty",
                "either `id` or `email` has to be specified to identify a user",
            ));
        }

        let query = format!(
            "select {} from users \
                where ($1::integer is null or id = $1) \
                and ($2::text is null or email = $2)",
            Self::COL_NAMES,
        );
        Ok(db.query_opt(&query, &[&id, &email]).await?.map(Self::from_row))
    }

    /// Creates a user and all posts given in `data.posts` in one statement, so
    /// either everything or nothing is stored.
    #[tracing::instrument(
        name = "User.create",
        skip_all,
        fields(db.model = "User", db.action = "create"),
    )]
    pub(crate) async fn create(db: &Db, data: UserCreateInput) -> ApiResult<Self> {
        let posts = data.posts.unwrap_or_default();
        let titles = posts.iter().map(|p| p.title.as_str()).collect::<Vec<_>>();
        let contents = posts.iter()
            .map(|p| p.content.as_deref().filter(|c| !c.is_empty()))
            .collect::<Vec<_>>();

        let query = format!(
            "with new_user as (
                insert into users (name, email) values ($1, $2)
                returning {cols}
            ), new_posts as (
                insert into posts (title, content, author_id)
                select p.title, p.content, new_user.id
                from new_user, unnest($3::text[], $4::text[]) with ordinality as p(title, content, i)
                order by p.i
            )
            select {cols} from new_user",
            cols = Self::COL_NAMES,
        );
        let result = db.query_one(&query, &[&data.name, &data.email, &titles, &contents]).await;
        let row = map_db_err!(result, {
            if constraint == "users_email_unique" => invalid_input!(
                key = "user.email-taken",
                "a user with email '{}' already exists",
                data.email,
            ),
        })?;

        let user = Self::from_row(row);
        debug!("Created user {} with {} posts", user.id, posts.len());
        Ok(user)
    }
}
