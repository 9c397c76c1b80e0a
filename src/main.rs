#[macro_use]
extern crate rocket;

mod article;
mod comment;
mod config;
mod db;
mod profile;
mod social;
mod tags;
mod types;
mod users;
mod utils;

use dotenv::dotenv;
use rocket::fairing::AdHoc;
use rocket::serde::json::{json, Value};
use rocket::tokio::task;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::db::Db;

#[catch(404)]
fn not_found() -> Value {
    json!({
        "errors": [
            "entity not found"
        ]
    })
}

#[catch(422)]
fn unprocessable() -> Value {
    json!({
        "errors": [
            "unprocessable entity"
        ]
    })
}

/// Reads `AppConfig` and opens the connection pool before launch.
fn database() -> AdHoc {
    AdHoc::try_on_ignite("Database pool", |rocket| async move {
        let config = match rocket.figment().extract::<AppConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "invalid configuration");
                return Err(rocket);
            }
        };
        let timeout = config.storage_timeout();
        let pool_size = config.pool_size;
        let pool = match task::spawn_blocking(move || db::init_pool(pool_size, timeout)).await {
            Ok(Ok(pool)) => pool,
            Ok(Err(e)) => {
                error!(error = %e, "failed to create database pool");
                return Err(rocket);
            }
            Err(e) => {
                error!(error = %e, "pool initialization panicked");
                return Err(rocket);
            }
        };
        info!(pool_size, timeout_ms = config.storage_timeout_ms, "database pool ready");
        Ok(rocket.manage(config).manage(Db::new(pool, timeout)))
    })
}

#[launch]
fn rocket() -> _ {
    dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    rocket::build()
        .attach(database())
        .mount(
            "/api",
            routes![
                users::register,
                users::login,
                users::current,
                users::update,
                profile::profile,
                profile::follow,
                profile::unfollow,
                article::list,
                article::feed,
                article::create,
                article::get,
                article::update,
                article::delete,
                article::favorite,
                article::unfavorite,
                comment::add,
                comment::list,
                comment::delete,
                tags::tags,
            ],
        )
        .register("/", catchers![not_found, unprocessable])
}
