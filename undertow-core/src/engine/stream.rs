//! Piece-aligned reads over one file of a download.

use std::io::SeekFrom;
use std::ops::Range;
use std::path::PathBuf;

use bytes::Bytes;
use futures::Stream;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Where a streamed file lives and how it maps onto pieces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub path: PathBuf,
    pub file_size: u64,
    /// Byte offset of the file inside the torrent's concatenated payload.
    pub file_offset: u64,
    pub piece_length: u64,
}

impl StreamTarget {
    /// Splits `start..start+len` (file coordinates) at piece boundaries.
    pub fn chunks(&self, start: u64, len: u64) -> Vec<Range<u64>> {
        let end = start.saturating_add(len).min(self.file_size);
        let mut chunks = Vec::new();
        let mut position = start;
        while position < end {
            let absolute = self.file_offset + position;
            let boundary = if self.piece_length == 0 {
                end
            } else {
                (absolute / self.piece_length + 1) * self.piece_length - self.file_offset
            };
            let next = boundary.min(end);
            chunks.push(position..next);
            position = next;
        }
        chunks
    }

    /// Piece index holding file byte `position`.
    pub fn piece_at(&self, position: u64) -> u64 {
        if self.piece_length == 0 {
            return 0;
        }
        (self.file_offset + position) / self.piece_length
    }

    /// Streams `len` bytes from `start`, one piece-aligned chunk per item.
    pub fn read_range(
        &self,
        start: u64,
        len: u64,
    ) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
        let path = self.path.clone();
        let chunks = self.chunks(start, len);
        futures::stream::unfold(
            (None::<tokio::fs::File>, chunks.into_iter()),
            move |(file, mut remaining)| {
                let path = path.clone();
                async move {
                    let chunk = remaining.next()?;
                    let mut file = match file {
                        Some(file) => file,
                        None => match open_at(&path, chunk.start).await {
                            Ok(file) => file,
                            Err(e) => return Some((Err(e), (None, Vec::new().into_iter()))),
                        },
                    };
                    let mut buf = vec![0u8; (chunk.end - chunk.start) as usize];
                    match file.read_exact(&mut buf).await {
                        Ok(_) => Some((Ok(Bytes::from(buf)), (Some(file), remaining))),
                        Err(e) => Some((Err(e), (None, Vec::new().into_iter()))),
                    }
                }
            },
        )
    }
}

async fn open_at(path: &std::path::Path, position: u64) -> std::io::Result<tokio::fs::File> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(position)).await?;
    Ok(file)
}
