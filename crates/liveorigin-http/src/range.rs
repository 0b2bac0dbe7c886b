//! Byte-range negotiation.
//!
//! A `Range` header is parsed into [`RangeSpec`]s, then checked against the
//! resource extent. For a resource of known size every range must lie inside
//! it. For a resource that is still being produced, closed ranges are always
//! accepted (they bound the tail), while open-ended ranges need the client to
//! opt in because the reply cannot name a total length.

use liveorigin_common::{Error, Result};

/// One `bytes=` range as written by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `start-end`, both inclusive.
    Closed { start: u64, end: u64 },
    /// `start-`, until the end of the resource.
    From { start: u64 },
    /// `-len`, the last `len` bytes.
    Suffix { len: u64 },
}

impl RangeSpec {
    /// Parse the value of a `Range` header.
    ///
    /// Only the `bytes` unit is understood. At least one range must be
    /// present and every comma-separated entry must be well formed.
    pub fn parse_header(value: &str) -> Result<Vec<Self>> {
        let set = value
            .trim()
            .strip_prefix("bytes=")
            .ok_or_else(|| Error::protocol(format!("unsupported range unit: {value}")))?;

        let mut specs = Vec::new();
        for part in set.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            specs.push(Self::parse_one(part)?);
        }
        if specs.is_empty() {
            return Err(Error::protocol("empty range set"));
        }
        Ok(specs)
    }

    fn parse_one(part: &str) -> Result<Self> {
        let (start, end) = part
            .split_once('-')
            .ok_or_else(|| Error::protocol(format!("malformed range: {part}")))?;
        let num = |s: &str| {
            s.trim()
                .parse::<u64>()
                .map_err(|_| Error::protocol(format!("malformed range: {part}")))
        };
        match (start.trim().is_empty(), end.trim().is_empty()) {
            (false, false) => Ok(Self::Closed {
                start: num(start)?,
                end: num(end)?,
            }),
            (false, true) => Ok(Self::From { start: num(start)? }),
            (true, false) => Ok(Self::Suffix { len: num(end)? }),
            (true, true) => Err(Error::protocol(format!("malformed range: {part}"))),
        }
    }
}

/// A window of the resource to emit, `end` inclusive.
///
/// `end == None` means "until the producer finishes".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn closed(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn open(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Number of bytes in the window. `None` when the window is open or its
    /// length does not fit in a `u64`.
    pub fn window_len(&self) -> Option<u64> {
        self.end?.checked_sub(self.start)?.checked_add(1)
    }
}

/// What is known about the size of a resource at negotiation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceExtent {
    /// Complete resource of this many bytes.
    Known(u64),
    /// Resource still being produced; only the bytes written so far exist.
    Growing,
}

/// Outcome of negotiation: what to send and how to frame it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangePlan {
    /// Reply with 206 instead of 200.
    pub partial: bool,
    /// Windows to emit, in order.
    pub windows: Vec<ByteRange>,
    /// Total body length when it is known up front.
    pub body_len: Option<u64>,
    /// `Content-Range` value for single-range partial replies.
    pub content_range: Option<String>,
    /// The client bounded a growing resource; stop once the window end is
    /// sent even if the producer keeps writing.
    pub bounded: bool,
}

impl RangePlan {
    fn whole(extent: ResourceExtent) -> Self {
        match extent {
            ResourceExtent::Known(0) => Self {
                partial: false,
                windows: Vec::new(),
                body_len: Some(0),
                content_range: None,
                bounded: false,
            },
            ResourceExtent::Known(size) => Self {
                partial: false,
                windows: vec![ByteRange::closed(0, size - 1)],
                body_len: Some(size),
                content_range: None,
                bounded: false,
            },
            ResourceExtent::Growing => Self {
                partial: false,
                windows: vec![ByteRange::open(0)],
                body_len: None,
                content_range: None,
                bounded: false,
            },
        }
    }

    /// Whole-resource plan starting at `offset` of a growing resource.
    ///
    /// Used for hold/tune-in where a non-ranged reader joins mid-stream.
    pub fn tail_from(offset: u64) -> Self {
        Self {
            partial: false,
            windows: vec![ByteRange::open(offset)],
            body_len: None,
            content_range: None,
            bounded: false,
        }
    }

}

/// Negotiate a `Range` header against a resource.
///
/// `accepts_open` is the client's opt-in for open-ended ranges on growing
/// resources.
pub fn negotiate(
    header: Option<&str>,
    extent: ResourceExtent,
    accepts_open: bool,
) -> Result<RangePlan> {
    let Some(value) = header else {
        return Ok(RangePlan::whole(extent));
    };
    let specs = RangeSpec::parse_header(value)?;

    match extent {
        ResourceExtent::Known(size) => negotiate_known(&specs, size),
        ResourceExtent::Growing => negotiate_growing(&specs, accepts_open),
    }
}

fn negotiate_known(specs: &[RangeSpec], size: u64) -> Result<RangePlan> {
    let mut windows = Vec::with_capacity(specs.len());
    for spec in specs {
        let (start, end) = match *spec {
            RangeSpec::Closed { start, end } => (start, end),
            RangeSpec::From { start } => (start, size.saturating_sub(1)),
            RangeSpec::Suffix { len } => {
                if len == 0 {
                    return Err(Error::range("zero-length suffix range"));
                }
                (size.saturating_sub(len), size.saturating_sub(1))
            }
        };
        if size == 0 || start > end || end >= size {
            return Err(Error::range(format!(
                "range {start}-{end} outside resource of {size} bytes"
            )));
        }
        windows.push(ByteRange::closed(start, end));
    }

    if let [ByteRange {
        start,
        end: Some(end),
    }] = *windows.as_slice()
    {
        if start == 0 && end == size - 1 {
            return Ok(RangePlan::whole(ResourceExtent::Known(size)));
        }
        return Ok(RangePlan {
            partial: true,
            body_len: Some(end - start + 1),
            content_range: Some(format!("bytes {start}-{end}/{size}")),
            windows,
            bounded: false,
        });
    }

    // Several windows are concatenated in a chunked body without multipart
    // boundaries.
    Ok(RangePlan {
        partial: true,
        windows,
        body_len: None,
        content_range: None,
        bounded: false,
    })
}

fn negotiate_growing(specs: &[RangeSpec], accepts_open: bool) -> Result<RangePlan> {
    let mut windows = Vec::with_capacity(specs.len());
    for spec in specs {
        match *spec {
            RangeSpec::Closed { start, end } => {
                if start > end {
                    return Err(Error::range(format!("range {start}-{end} is inverted")));
                }
                let window = ByteRange::closed(start, end);
                if window.window_len().is_none() {
                    return Err(Error::range(format!("range {start}-{end} is too long")));
                }
                windows.push(window);
            }
            RangeSpec::From { start } => {
                if !accepts_open {
                    return Err(Error::range(
                        "open range on a resource still being produced",
                    ));
                }
                windows.push(ByteRange::open(start));
            }
            RangeSpec::Suffix { .. } => {
                return Err(Error::range(
                    "suffix range on a resource still being produced",
                ));
            }
        }
    }

    if let [only] = windows.as_slice() {
        return Ok(match only.end {
            Some(end) => RangePlan {
                partial: true,
                body_len: only.window_len(),
                content_range: Some(format!("bytes {}-{end}/*", only.start)),
                windows: windows.clone(),
                bounded: true,
            },
            None => RangePlan {
                partial: true,
                body_len: None,
                content_range: Some(format!("bytes {}-*/*", only.start)),
                windows: windows.clone(),
                bounded: false,
            },
        });
    }

    let bounded = windows.iter().all(|w| w.end.is_some());
    Ok(RangePlan {
        partial: true,
        windows,
        body_len: None,
        content_range: None,
        bounded,
    })
}

/// Parse the `Content-Range` of a byte-range patch upload.
///
/// Accepts `bytes start-end/total` and `bytes start-end/*` and returns the
/// inclusive window.
pub fn parse_content_range(value: &str) -> Result<(u64, u64)> {
    let rest = value
        .trim()
        .strip_prefix("bytes ")
        .ok_or_else(|| Error::protocol(format!("unsupported Content-Range: {value}")))?;
    let (window, _total) = rest
        .split_once('/')
        .ok_or_else(|| Error::protocol(format!("malformed Content-Range: {value}")))?;
    match RangeSpec::parse_one(window)? {
        RangeSpec::Closed { start, end } if start <= end => Ok((start, end)),
        RangeSpec::Closed { .. } => Err(Error::range(format!("inverted Content-Range: {value}"))),
        _ => Err(Error::protocol(format!("malformed Content-Range: {value}"))),
    }
}
