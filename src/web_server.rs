use actix_web::{App, HttpServer, dev::Server, middleware, web};
use tokio::sync::Semaphore;

use crate::config::ServerConfig;
use crate::judge::Judge;
use crate::routes::{
    get_health_handler, get_languages_handler, json_error_handler, post_judge_handler,
};

/// Registers the engine's routes; shared by the server and the tests
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .service(post_judge_handler)
        .service(get_health_handler)
        .service(get_languages_handler);
}

/// Limits how many submissions are judged at the same time
pub fn submission_slots(max_concurrent: usize) -> web::Data<Semaphore> {
    web::Data::new(Semaphore::new(max_concurrent.max(1)))
}

pub fn build_server(
    server_config: ServerConfig,
    judge: Judge,
    max_concurrent: usize,
) -> std::io::Result<Server> {
    let judge = web::Data::new(judge);
    let slots = submission_slots(max_concurrent);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(judge.clone())
            .app_data(slots.clone())
            .wrap(middleware::Logger::default())
            .configure(configure)
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}
