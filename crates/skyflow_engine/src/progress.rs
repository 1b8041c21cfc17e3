//! Completion estimate for a streamed result document.
//!
//! The final size of a download is rarely announced, so the estimate is
//! rebuilt after every chunk from what the bytes seen so far reveal:
//! row-tagged XML extrapolates the average row size to the expected number
//! of rows, FITS declares its exact size in the extension header, and
//! anything else gets a proportional headroom that saturates below 100%.

use crate::table::fits;
use crate::table::TableFormat;

/// Bytes kept from the start of the stream for format sniffing and headers
const HEAD_LIMIT: usize = 64 * 1024;

/// Allowance for the closing tags after the last row
const TRAILER_BYTES: u64 = 128;

/// Headroom fraction (1/n of seen bytes) and floor of the fallback estimate
const FALLBACK_FRACTION: u64 = 32;
const FALLBACK_FLOOR: u64 = 1024 * 1024;

/// Largest percentage reported while a transfer is running
pub const RUNNING_CEILING: f64 = 99.9;

const ROW_TAG: &[u8] = b"<TR";

#[derive(Debug)]
pub struct ProgressEstimator {
    expected_records: Option<u64>,
    seen: u64,
    head: Vec<u8>,
    format: Option<TableFormat>,
    fits_total: Option<u64>,
    rows_seen: u64,
    first_row_at: Option<u64>,
    /// Last bytes of the previous chunk, so row tags split across chunks count
    carry: Vec<u8>,
}

impl ProgressEstimator {
    pub fn new(expected_records: Option<u64>) -> Self {
        Self {
            expected_records: expected_records.filter(|n| *n > 0),
            seen: 0,
            head: Vec::new(),
            format: None,
            fits_total: None,
            rows_seen: 0,
            first_row_at: None,
            carry: Vec::new(),
        }
    }

    pub fn bytes_seen(&self) -> u64 {
        self.seen
    }

    /// Account for one chunk and return the completion percentage in
    /// `[0, RUNNING_CEILING]`.
    pub fn observe(&mut self, chunk: &[u8]) -> f64 {
        let before = self.seen;
        self.seen += chunk.len() as u64;

        if self.head.len() < HEAD_LIMIT {
            let take = (HEAD_LIMIT - self.head.len()).min(chunk.len());
            self.head.extend_from_slice(&chunk[..take]);
        }
        if self.format.is_none() {
            self.format = TableFormat::detect(&self.head);
        }

        match self.format {
            Some(TableFormat::VoTable) => self.count_rows(before, chunk),
            Some(TableFormat::Fits) if self.fits_total.is_none() => {
                self.fits_total = fits::bintable_extent(&self.head);
            }
            _ => {}
        }
        self.percent()
    }

    fn count_rows(&mut self, before: u64, chunk: &[u8]) {
        let mut window = std::mem::take(&mut self.carry);
        let window_start = before - window.len() as u64;
        window.extend_from_slice(chunk);
        // The carried tail is shorter than the tag, so no match is counted twice
        for (index, _) in window
            .windows(ROW_TAG.len())
            .enumerate()
            .filter(|(_, w)| *w == ROW_TAG)
        {
            if self.first_row_at.is_none() {
                self.first_row_at = Some(window_start + index as u64);
            }
            self.rows_seen += 1;
        }
        let keep = window.len().min(ROW_TAG.len() - 1);
        self.carry = window[window.len() - keep..].to_vec();
    }

    /// Current estimate of the total document size.
    pub fn estimated_total(&self) -> u64 {
        if let Some(total) = self.fits_total {
            return total;
        }
        if let (Some(expected), Some(header), true) =
            (self.expected_records, self.first_row_at, self.rows_seen > 0)
        {
            // Rows after the last tag seen are still being received
            let body = (self.seen - header) as f64;
            let per_row = body / self.rows_seen as f64;
            return header + (per_row * expected as f64) as u64 + TRAILER_BYTES;
        }
        self.seen + self.seen / FALLBACK_FRACTION + FALLBACK_FLOOR
    }

    pub fn percent(&self) -> f64 {
        let total = self.estimated_total().max(1);
        let percent = 100.0 * self.seen as f64 / total as f64;
        percent.clamp(0.0, RUNNING_CEILING)
    }
}
