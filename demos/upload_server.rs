use futures::TryStreamExt;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use hyper_form_data::{Error, MultipartRequest, Part};
use log::{debug, error, info};
use std::convert::Infallible;
use std::net::SocketAddr;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    pretty_env_logger::init();

    let addr: SocketAddr = std::env::var("LISTEN_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:3000".to_owned())
        .parse()
        .expect("LISTEN_ADDR must be a socket address");

    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(route)) });

    info!("Listening on http://{}", addr);
    if let Err(e) = Server::bind(&addr).serve(make_svc).await {
        error!("Server error: {}", e);
    }
}

async fn route(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let res = match (req.method(), req.uri().path()) {
        (&Method::POST, "/multipartData") => multipart_data(req).await,
        (&Method::POST, "/parts") => parts(req).await,
        (&Method::POST, "/transferTo") => transfer_to(req).await,
        _ => Ok(status(StatusCode::NOT_FOUND, "")),
    };

    Ok(res.unwrap_or_else(|e| {
        error!("Request failed: {}", e);
        let code = if e.is_transfer() {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::BAD_REQUEST
        };
        status(code, &e.to_string())
    }))
}

/// Prints every field and file name, keyed by part name.
async fn multipart_data(req: Request<Body>) -> Result<Response<Body>, Error> {
    let parts = req.into_multipart()?.to_map().await?;

    let mut lines: Vec<String> = parts
        .iter()
        .map(|(name, part)| match part {
            Part::Field(field) => format!("{} = {:?}", name, field.value()),
            Part::File(file) => format!("{} = file {:?}", name, file.filename()),
        })
        .collect();
    lines.sort();

    Ok(status(StatusCode::OK, &lines.join("\n")))
}

/// Lists the parts in the order they were sent, reading file bodies as they pass.
async fn parts(req: Request<Body>) -> Result<Response<Body>, Error> {
    let mut multipart = req.into_multipart()?;
    let mut lines = Vec::new();

    while let Some(part) = multipart.try_next().await? {
        match part {
            Part::Field(field) => lines.push(format!("field {}", field.name())),
            Part::File(file) => {
                let name = file.name().to_owned();
                let len = file.bytes().await?.len();
                lines.push(format!("file {} ({} bytes)", name, len));
            }
        }
    }

    Ok(status(StatusCode::OK, &lines.join("\n")))
}

/// Stores the first uploaded file in a temp file and answers with its path.
async fn transfer_to(req: Request<Body>) -> Result<Response<Body>, Error> {
    let mut multipart = req.into_multipart()?;
    let pool = multipart.blocking_pool().clone();

    while let Some(part) = multipart.try_next().await? {
        let file = match part {
            Part::File(file) => file,
            Part::Field(_) => continue,
        };

        let dest = pool
            .create_temp_file("upload_server")
            .await
            .map_err(|source| Error::Transfer {
                path: std::env::temp_dir(),
                written: 0,
                source,
            })?;

        debug!("Transferring {:?} to {:?}", file.filename(), dest);
        if let Err(e) = file.transfer_to(&dest).await {
            if let Err(rm) = pool.remove_file(&dest).await {
                error!("Removing {:?} failed: {}", dest, rm);
            }
            return Err(e);
        }

        return Ok(status(StatusCode::OK, &dest.display().to_string()));
    }

    Ok(status(StatusCode::BAD_REQUEST, "no file part"))
}

fn status(code: StatusCode, body: &str) -> Response<Body> {
    let mut res = Response::new(Body::from(body.to_owned()));
    *res.status_mut() = code;
    res
}
