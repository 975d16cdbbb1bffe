//! Client request identity and tcUrl discovery
//!
//! The connect command's tcUrl, plus the stream name from publish/play,
//! identify which source a connection is about. Encoders smuggle the vhost
//! through several ad-hoc separators (`,`, `...`, `&&`, `=`), so discovery
//! first normalizes those to `?` before splitting the query out.

use crate::amf::Amf0Object;
use crate::protocol::constants::{RTMP_DEFAULT_PORT, RTMP_DEFAULT_VHOST, RTMP_DEFAULT_VHOST_PARAM};

/// Everything the server knows about what a client asked for
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub schema: String,
    pub host: String,
    pub vhost: String,
    pub port: u16,
    pub app: String,
    pub stream: String,
    pub param: String,
    pub tc_url: String,
    pub page_url: String,
    pub swf_url: String,
    pub object_encoding: f64,
    /// play duration in seconds; -1 means until the stream ends
    pub duration: f64,
    pub ip: String,
    pub args: Option<Amf0Object>,
}

impl Request {
    pub fn new() -> Self {
        Self {
            port: RTMP_DEFAULT_PORT,
            duration: -1.0,
            ..Default::default()
        }
    }

    /// Resolve schema/host/vhost/app/port (and possibly vhost hidden in the
    /// stream name) from the tcUrl, then strip stray separators.
    pub fn discover(&mut self) {
        let (schema, host, vhost, app, stream, port, param) =
            discover_tc_url(&self.tc_url, &self.stream);
        self.schema = schema;
        self.host = host;
        self.vhost = vhost;
        self.app = app;
        self.stream = stream;
        self.port = port;
        self.param = param;
        self.strip();
    }

    /// Canonical stream URL: `vhost/app/stream`, vhost omitted when default
    pub fn stream_url(&self) -> String {
        generate_stream_url(&self.vhost, &self.app, &self.stream)
    }

    fn strip(&mut self) {
        strip_chars(&mut self.host, "/ \n\r\t");
        strip_chars(&mut self.vhost, "/ \n\r\t");
        strip_chars(&mut self.app, " \n\r\t");
        strip_chars(&mut self.stream, " \n\r\t");

        self.app = self.app.trim_matches('/').to_string();
        self.stream = self.stream.trim_matches('/').to_string();
    }
}

/// Canonical stream URL shared by the registry and logging
pub fn generate_stream_url(vhost: &str, app: &str, stream: &str) -> String {
    let vhost = if vhost == RTMP_DEFAULT_VHOST { "" } else { vhost };
    format!("{}/{}/{}", vhost, app, stream)
}

fn strip_chars(s: &mut String, remove: &str) {
    s.retain(|c| !remove.contains(c));
}

/// Split a tcUrl into its parts, recovering the vhost from the query of
/// either the app or the stream name.
pub fn discover_tc_url(
    tc_url: &str,
    stream: &str,
) -> (String, String, String, String, String, u16, String) {
    let mut schema = String::new();
    let mut host = String::new();
    let mut port = RTMP_DEFAULT_PORT;
    let mut url = tc_url.to_string();

    if let Some(pos) = url.find("://") {
        schema = url[..pos].to_string();
        url = url[pos + 3..].to_string();
    }

    if let Some(pos) = url.find('/') {
        host = url[..pos].to_string();
        url = url[pos + 1..].to_string();

        if let Some(pos) = host.find(':') {
            port = host[pos + 1..].parse().unwrap_or(RTMP_DEFAULT_PORT);
            host = host[..pos].to_string();
        }
    } else {
        host = url.clone();
        url.clear();
        if let Some(pos) = host.find(':') {
            port = host[pos + 1..].parse().unwrap_or(RTMP_DEFAULT_PORT);
            host = host[..pos].to_string();
        }
    }

    let mut app = url;
    let mut stream = stream.to_string();
    let mut vhost = host.clone();
    let mut param = String::new();

    vhost_resolve(&mut vhost, &mut app, &mut param);
    vhost_resolve(&mut vhost, &mut stream, &mut param);

    if param == RTMP_DEFAULT_VHOST_PARAM {
        param.clear();
    }

    (schema, host, vhost, app, stream, port, param)
}

/// Pull a `vhost?VALUE` token out of the target's query string.
///
/// The separators `,`, `...`, `&&` and `=` are legacy vhost-smuggling forms;
/// all become `?` before the query is split off. A trailing `/_definst_`
/// (Wowza's default instance) is dropped.
fn vhost_resolve(vhost: &mut String, target: &mut String, param: &mut String) {
    if let Some(pos) = target.find('?') {
        *param = target[pos..].to_string();
    }

    let mut t = target.replace(',', "?").replace("...", "?").replace("&&", "?").replace('=', "?");
    if let Some(stripped) = t.strip_suffix("/_definst_") {
        t = stripped.to_string();
    }

    if let Some(pos) = t.find('?') {
        let query = t[pos + 1..].to_string();
        t.truncate(pos);

        if let Some(vpos) = query.find("vhost?") {
            let mut value = query[vpos + 6..].to_string();
            if let Some(qpos) = value.find('?') {
                value.truncate(qpos);
            }
            if !value.is_empty() {
                *vhost = value;
            }
        }
    }

    *target = t;
}
