//! The static content handler: maps the normalized URI onto the document
//! root and streams the file through the output filter chain as a single
//! file-backed buffer.

use std::fs::{File, Metadata};
use std::io;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::UNIX_EPOCH;

use crate::buf::{Buf, Chain};
use crate::http::filter::FilterCode;
use crate::http::lifecycle::Fin;
use crate::http::phase::PhaseCode;
use crate::http::Method;
use crate::prelude::*;

/// The open-file service contract: path in, handle plus metadata out.
/// A cache would slot in behind this signature.
pub fn open_file(path: &PathBuf) -> io::Result<(Rc<File>, Metadata)> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;
    Ok((Rc::new(file), metadata))
}

pub fn static_phase(w: &mut Worker, rid: Rid) -> PhaseCode {
    let (uri, args, root, method, allowed) = {
        let Some(request) = w.req(rid) else {
            return PhaseCode::Declined;
        };
        (
            request.uri.clone(),
            request.args.clone(),
            request.root().to_string(),
            request.method.clone(),
            request
                .loc
                .as_ref()
                .map(|l| l.conf.methods.clone())
                .unwrap_or_default(),
        )
    };

    if !allowed.is_empty() && !allowed.iter().any(|m| m == method.as_str()) {
        return PhaseCode::Status(HTTP_METHOD_NOT_ALLOWED);
    }
    if !matches!(method, Method::Get | Method::Head) {
        return PhaseCode::Status(HTTP_METHOD_NOT_ALLOWED);
    }
    if uri == "*" {
        return PhaseCode::Status(HTTP_BAD_REQUEST);
    }

    // Directory URI: consult the index list and restart matching on the
    // chosen file so its own location applies.
    if uri.ends_with('/') {
        let index_files = {
            let Some(request) = w.req(rid) else {
                return PhaseCode::Declined;
            };
            request.index_files().to_vec()
        };
        for index in &index_files {
            let mut probe = PathBuf::from(&root);
            probe.push(uri.trim_start_matches('/'));
            probe.push(index);
            if probe.is_file() {
                let target = format!("{uri}{index}");
                w.internal_redirect(rid, target, Some(args));
                return PhaseCode::Done;
            }
        }
        return PhaseCode::Status(HTTP_FORBIDDEN);
    }

    let mut path = PathBuf::from(&root);
    path.push(uri.trim_start_matches('/'));

    let (file, metadata) = match open_file(&path) {
        Ok(opened) => opened,
        Err(e) => {
            let status = match e.kind() {
                io::ErrorKind::NotFound => HTTP_NOT_FOUND,
                io::ErrorKind::PermissionDenied => HTTP_FORBIDDEN,
                _ => HTTP_INTERNAL_SERVER_ERROR,
            };
            if status == HTTP_INTERNAL_SERVER_ERROR {
                error!(path = %path.display(), error = %e, "open failed");
            } else {
                debug!(path = %path.display(), error = %e, "open failed");
            }
            return PhaseCode::Status(status);
        }
    };

    if metadata.is_dir() {
        // Canonical directory form carries the trailing slash.
        let Some(request) = w.req_mut(rid) else {
            return PhaseCode::Declined;
        };
        let mut target = format!("{uri}/");
        if !args.is_empty() {
            target.push('?');
            target.push_str(&args);
        }
        request.headers_out.location = Some(target);
        return PhaseCode::Status(HTTP_MOVED_PERMANENTLY);
    }
    if !metadata.is_file() {
        return PhaseCode::Status(HTTP_NOT_FOUND);
    }

    let size = metadata.len();
    {
        let Some(request) = w.req_mut(rid) else {
            return PhaseCode::Declined;
        };
        let out = &mut request.headers_out;
        out.status = HTTP_OK;
        out.content_length = Some(size);
        out.content_type = Some(
            mime_guess::from_path(&path)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
        );
        out.accept_ranges = true;
        if let Ok(modified) = metadata.modified() {
            out.last_modified = Some(modified);
            if let Ok(stamp) = modified.duration_since(UNIX_EPOCH) {
                out.etag = Some(format!("\"{:x}-{:x}\"", stamp.as_secs(), size));
            }
        }
    }

    if w.send_header(rid) == FilterCode::Error {
        return PhaseCode::Status(HTTP_INTERNAL_SERVER_ERROR);
    }

    let header_only = w.req(rid).map(|r| r.header_only).unwrap_or(true);
    let mut chain = Chain::new();
    if header_only || size == 0 {
        chain.push_back(Buf::last());
    } else {
        let mut buf = Buf::file(file, 0, size);
        buf.last_buf = true;
        chain.push_back(buf);
    }

    match w.output_filter(rid, chain) {
        FilterCode::Ok => PhaseCode::Ok,
        FilterCode::Again => PhaseCode::Again,
        FilterCode::Error => {
            w.finalize_request(rid, Fin::Error);
            PhaseCode::Done
        }
    }
}
