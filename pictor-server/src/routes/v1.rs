use axum::{
    Router,
    routing::{get, post},
};

use crate::handlers::{extension_socket, extensions};
use crate::state::AppState;

pub fn create_v1_router(_state: AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/extensions",
            get(extensions::list_extensions)
                .post(extensions::install_extension),
        )
        .route(
            "/extensions/{id}",
            get(extensions::get_extension)
                .put(extensions::update_extension)
                .delete(extensions::uninstall_extension),
        )
        .route("/extensions/{id}/pause", post(extensions::pause_extension))
        .route(
            "/extensions/{id}/resume",
            post(extensions::resume_extension),
        )
        .route(
            "/extensions/{id}/synchronise",
            post(extensions::synchronise_extension),
        )
        .route(
            "/extensions/{id}/settings",
            get(extensions::get_settings).put(extensions::put_settings),
        )
        .route(
            "/extensions/{id}/commands/image",
            post(extensions::run_image_command),
        )
        .route(
            "/extensions/{id}/commands/process",
            post(extensions::run_process_command),
        )
        .route(
            "/capabilities/text-embeddings",
            post(extensions::compute_text_embeddings),
        )
        .route(
            "/extensions/socket",
            get(extension_socket::extension_socket_handler),
        )
}
