//! Response status table and header assembly.
//!
//! Headers are formatted into a fixed-capacity buffer; file bodies are never
//! copied into it but handed to the scatter write as a second buffer.

use bytes::BytesMut;
use std::fmt::{self, Write as _};
use thiserror::Error;

/// Capacity of a connection's header/write buffer.
pub const WRITE_BUFFER_SIZE: usize = 1024;

/// Response status produced by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::InternalError => 500,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::InternalError => "Internal Error",
        }
    }

    /// Fixed body sent with error statuses.
    pub fn form(self) -> Option<&'static str> {
        match self {
            Status::Ok => None,
            Status::BadRequest => {
                Some("Your request has bad syntax or is inherently impossible to satisfy.\n")
            }
            Status::Forbidden => Some("You do not have permission to get file from this server.\n"),
            Status::NotFound => Some("The requested file was not found on this server.\n"),
            Status::InternalError => {
                Some("There was an unusual problem serving the requested file.\n")
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResponseError {
    #[error("response buffer full ({capacity} bytes)")]
    BufferFull { capacity: usize },
}

/// Fixed-capacity buffer holding the status line, headers and, for error
/// statuses, the body.
pub struct ResponseBuffer {
    buf: BytesMut,
    capacity: usize,
}

impl ResponseBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes written so far (the write index).
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Format straight into the buffer. A write that overruns the capacity
    /// is rolled back.
    fn add_response(&mut self, args: fmt::Arguments<'_>) -> Result<(), ResponseError> {
        let start = self.buf.len();
        if self.buf.write_fmt(args).is_err() || self.buf.len() > self.capacity {
            self.buf.truncate(start);
            return Err(ResponseError::BufferFull {
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    pub fn add_status_line(&mut self, status: Status) -> Result<(), ResponseError> {
        self.add_response(format_args!(
            "HTTP/1.1 {} {}\r\n",
            status.code(),
            status.title()
        ))
    }

    /// `Content-Length`, `Content-Type`, `Connection` and the blank line.
    pub fn add_headers(&mut self, content_length: usize, linger: bool) -> Result<(), ResponseError> {
        self.add_response(format_args!("Content-Length: {content_length}\r\n"))?;
        self.add_response(format_args!("Content-Type: text/html\r\n"))?;
        self.add_response(format_args!(
            "Connection: {}\r\n",
            if linger { "keep-alive" } else { "close" }
        ))?;
        self.add_response(format_args!("\r\n"))
    }

    pub fn add_content(&mut self, content: &str) -> Result<(), ResponseError> {
        self.add_response(format_args!("{content}"))
    }

    /// Assemble a complete response head. For error statuses the fixed form
    /// is appended as the body; for `Status::Ok` the caller supplies the body
    /// separately and `body_len` is its length.
    pub fn build(&mut self, status: Status, body_len: usize, linger: bool) -> Result<(), ResponseError> {
        self.clear();
        match status.form() {
            Some(form) => {
                self.add_status_line(status)?;
                self.add_headers(form.len(), linger)?;
                self.add_content(form)
            }
            None => {
                self.add_status_line(status)?;
                self.add_headers(body_len, linger)
            }
        }
    }
}
