use http::{Method, StatusCode};

/// An HTTP/3 request that isn't a WebTransport upgrade.
///
/// Only the method is decoded; the request isn't retained after the gate answers it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlainRequest {
    method: Option<Method>,
}

impl PlainRequest {
    pub fn new(method: Option<Method>) -> Self {
        Self { method }
    }

    /// The request method, or None if the peer didn't send a valid one.
    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }
}

/// Decides the status of plain HTTP/3 requests arriving on a WebTransport listener.
///
/// Without a gate, stray requests would only see an opaque protocol error.
pub trait RequestGate: Send + Sync + 'static {
    fn status(&self, request: &PlainRequest) -> StatusCode;
}

impl<F> RequestGate for F
where
    F: Fn(&PlainRequest) -> StatusCode + Send + Sync + 'static,
{
    fn status(&self, request: &PlainRequest) -> StatusCode {
        self(request)
    }
}

/// The default gate: `GET` is answered with 200, everything else with 405.
#[derive(Clone, Copy, Debug, Default)]
pub struct MethodGate;

impl RequestGate for MethodGate {
    fn status(&self, request: &PlainRequest) -> StatusCode {
        if request.method() == Some(&Method::GET) {
            StatusCode::OK
        } else {
            StatusCode::METHOD_NOT_ALLOWED
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(gate: &dyn RequestGate, method: Option<Method>) -> StatusCode {
        gate.status(&PlainRequest::new(method))
    }

    #[test]
    fn get_is_accepted() {
        assert_eq!(status(&MethodGate, Some(Method::GET)), StatusCode::OK);
    }

    #[test]
    fn other_methods_are_not_allowed() {
        for method in [Method::POST, Method::PUT, Method::DELETE, Method::HEAD] {
            assert_eq!(
                status(&MethodGate, Some(method)),
                StatusCode::METHOD_NOT_ALLOWED
            );
        }
    }

    #[test]
    fn missing_method_is_not_allowed() {
        assert_eq!(status(&MethodGate, None), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn closures_are_gates() {
        let gate = |request: &PlainRequest| {
            if request.method() == Some(&Method::POST) {
                StatusCode::ACCEPTED
            } else {
                StatusCode::NOT_FOUND
            }
        };

        assert_eq!(status(&gate, Some(Method::POST)), StatusCode::ACCEPTED);
        assert_eq!(status(&gate, Some(Method::GET)), StatusCode::NOT_FOUND);
    }
}
