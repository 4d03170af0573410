use actix_web::{
    body::EitherBody,
    dev::{self, Service, ServiceRequest, ServiceResponse, Transform},
    http::{
        header::{self, HeaderMap, HeaderValue},
        Method,
    },
    HttpResponse,
};
use futures::future::{ready, LocalBoxFuture, Ready};

/// Permissive CORS for browser frontends: every response carries the allow headers, and
/// preflight OPTIONS requests are answered directly without touching the routed handlers.
pub(crate) struct Cors;

impl<S, B> Transform<S, ServiceRequest> for Cors
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = CorsMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(CorsMiddleware { service }))
    }
}

pub(crate) struct CorsMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for CorsMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    dev::forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        if req.method() == Method::OPTIONS {
            let (request, _) = req.into_parts();
            let mut response = HttpResponse::NoContent().finish();
            apply_cors_headers(response.headers_mut());
            let response = ServiceResponse::new(request, response).map_into_right_body();
            return Box::pin(async move { Ok(response) });
        }

        let fut = self.service.call(req);
        Box::pin(async move {
            let mut response = fut.await?;
            apply_cors_headers(response.headers_mut());
            Ok(response.map_into_left_body())
        })
    }
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization, Accept, Origin, X-Requested-With"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS, GET, PUT, DELETE"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{
        get,
        http::StatusCode,
        test::{call_service, init_service, TestRequest},
        App,
    };

    #[get("/ping")]
    async fn ping() -> HttpResponse {
        HttpResponse::Ok().body("pong")
    }

    #[actix_web::test]
    async fn preflight_is_answered_directly() {
        let app = init_service(App::new().wrap(Cors).service(ping)).await;

        let request = TestRequest::default()
            .method(Method::OPTIONS)
            .uri("/ping")
            .to_request();
        let response = call_service(&app, request).await;

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|value| value.to_str().ok()),
            Some("*")
        );
    }

    #[actix_web::test]
    async fn routed_responses_carry_allow_headers() {
        let app = init_service(App::new().wrap(Cors).service(ping)).await;

        let response =
            call_service(&app, TestRequest::get().uri("/ping").to_request()).await;

        assert!(response.status().is_success());
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_METHODS)
                .and_then(|value| value.to_str().ok()),
            Some("POST, OPTIONS, GET, PUT, DELETE")
        );
    }
}
