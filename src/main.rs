use tracing::{error, info};
use factory_twin_pipeline::context::domain::AppContext;
use factory_twin_pipeline::pipeline::logic::Pipeline;
use factory_twin_pipeline::system::domain::{init_tracing, System};


#[tokio::main]
async fn main() {

    let system = match System::new() {
        Ok(system) => system,
        Err(e) => {
            eprintln!("Error: configuración inválida: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&system);
    let grace = system.shutdown_grace;

    let app_context = match AppContext::new(system).await {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Error: no se pudo iniciar el contexto: {}", e);
            std::process::exit(1);
        }
    };

    let pipeline = Pipeline::start(app_context);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Error: no se pudo escuchar la señal de cierre: {}", e);
    }

    let report = pipeline.shutdown(grace).await;
    match serde_json::to_string(&report) {
        Ok(json) => info!("Info: reporte de cierre {}", json),
        Err(e) => error!("Error: no se pudo serializar el reporte de cierre: {}", e),
    }
}
