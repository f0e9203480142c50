// Blocking HTTP plumbing shared by the embedding, completion and Milvus clients

use std::io::BufReader;
use std::time::Duration;

use tracing::{debug, warn};
use ureq::{BodyReader, RequestBuilder};
use ureq::typestate::WithBody;

pub(crate) fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}

/// POST a JSON body and read the whole response as text
pub(crate) fn post_json(
    agent: &ureq::Agent,
    url: &str,
    bearer: Option<&str>,
    body: &str,
) -> Result<String, ureq::Error> {
    debug!("POST {} ({} bytes)", url, body.len());

    json_request(agent, url, bearer)
        .send(body)
        .and_then(|mut resp| resp.body_mut().read_to_string())
}

/// POST a JSON body and return a line reader over the streamed response
pub(crate) fn post_json_streaming(
    agent: &ureq::Agent,
    url: &str,
    bearer: Option<&str>,
    body: &str,
) -> Result<BufReader<BodyReader<'static>>, ureq::Error> {
    debug!("POST {} ({} bytes, streaming)", url, body.len());

    let response = json_request(agent, url, bearer)
        .header("Accept", "text/event-stream")
        .send(body)?;
    Ok(BufReader::new(response.into_body().into_reader()))
}

fn json_request(agent: &ureq::Agent, url: &str, bearer: Option<&str>) -> RequestBuilder<WithBody> {
    let mut request = agent.post(url).header("Content-Type", "application/json");
    if let Some(token) = bearer {
        request = request.header("Authorization", &format!("Bearer {}", token));
    }
    request
}

/// Human readable description of a transport or status failure
pub(crate) fn describe_error(service: &str, error: &ureq::Error) -> String {
    let message = match error {
        ureq::Error::StatusCode(status) => format!("{} returned HTTP {}", service, status),
        ureq::Error::Timeout(_) => format!("{} request timed out", service),
        ureq::Error::ConnectionFailed | ureq::Error::HostNotFound => {
            format!("{} is unreachable", service)
        }
        other => format!("{} request failed: {}", service, other),
    };
    warn!("{}", message);
    message
}
