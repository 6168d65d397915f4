//! Reading sub-buffers back.
//!
//! A [`ChannelReader`] consumes one CPU's buffer of a channel, one complete
//! sub-buffer at a time. It can be polled directly with
//! [`try_read`](ChannelReader::try_read) or driven as a `Stream`, which is
//! woken by the delivery timer and ends once the channel has been closed and
//! drained.

use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::Arc;

use futures_util::stream::Stream;

use crate::buffer::RingBuffer;
use crate::channel::Channel;
use crate::error::{TraceError, TraceResult};
use crate::format::{SubbufferHeader, SUBBUF_HEADER_SIZE};
use crate::header::{align_pad, decode_header, HeaderFormat, EVENT_SIZE_MAX};
use crate::heartbeat::extend_timestamp;

/// A consumed sub-buffer.
#[derive(Clone, Debug)]
pub struct Subbuffer {
    header: SubbufferHeader,
    format: HeaderFormat,
    data: Vec<u8>,
}

impl Subbuffer {
    /// Parse a raw sub-buffer; `None` if its header is invalid.
    pub fn parse(data: Vec<u8>) -> Option<Subbuffer> {
        let header = SubbufferHeader::decode(&data)?;
        if header.subbuf_size as usize != data.len() || header.lost_size as usize > data.len() {
            return None;
        }
        let format = HeaderFormat::new(header.trace.has_heartbeat, header.trace.has_alignment);
        Some(Subbuffer {
            header,
            format,
            data,
        })
    }

    pub fn header(&self) -> &SubbufferHeader {
        &self.header
    }

    pub fn format(&self) -> HeaderFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes holding events (header excluded, lost tail excluded).
    pub fn used(&self) -> usize {
        self.data.len() - self.header.lost_size as usize
    }

    pub fn events(&self) -> Events<'_> {
        Events {
            subbuf: self,
            pos: SUBBUF_HEADER_SIZE,
            last_tsc: self.header.begin_tsc,
        }
    }
}

/// One decoded event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawEvent<'a> {
    /// Full cycle counter (extended when the trace uses compact headers).
    pub timestamp: u64,
    pub facility_id: u8,
    pub event_id: u8,
    /// Offset of the event header within the sub-buffer.
    pub offset: usize,
    /// Everything after the header, including alignment padding.
    pub payload: &'a [u8],
}

/// Iterator over the events of a [`Subbuffer`].
///
/// Stops early at an event whose size field saturated, since the position of
/// the next event is then unknown.
pub struct Events<'a> {
    subbuf: &'a Subbuffer,
    pos: usize,
    last_tsc: u64,
}

impl<'a> Iterator for Events<'a> {
    type Item = RawEvent<'a>;

    fn next(&mut self) -> Option<RawEvent<'a>> {
        let format = self.subbuf.format;
        let end = self.subbuf.used();
        let at = self.pos + align_pad(self.pos, format.header_align());
        let payload_start = at + format.header_size();
        if payload_start > end {
            return None;
        }
        let header = decode_header(&self.subbuf.data[at..], format)?;
        let size = header.event_size as usize;
        if size >= EVENT_SIZE_MAX || payload_start + size > end {
            self.pos = end;
            return None;
        }
        self.pos = payload_start + size;

        let timestamp = if format.heartbeat {
            extend_timestamp(self.last_tsc, header.timestamp as u32)
        } else {
            header.timestamp
        };
        self.last_tsc = timestamp;
        Some(RawEvent {
            timestamp,
            facility_id: header.facility_id,
            event_id: header.event_id,
            offset: at,
            payload: &self.subbuf.data[payload_start..payload_start + size],
        })
    }
}

/// Consumer of one CPU's buffer in a channel.
///
/// Holds the channel alive: buffers of a destroyed trace stay readable
/// until every reader is dropped.
pub struct ChannelReader {
    channel: Arc<Channel>,
    cpu: usize,
}

impl ChannelReader {
    pub fn new(channel: Arc<Channel>, cpu: usize) -> TraceResult<ChannelReader> {
        channel
            .buffer(cpu)
            .ok_or(TraceError::InvalidArgument)?
            .reader_attached();
        Ok(ChannelReader { channel, cpu })
    }

    #[inline]
    fn buffer(&self) -> &RingBuffer {
        self.channel.buffer_for(self.cpu)
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Take the oldest complete sub-buffer without waiting.
    pub fn try_read(&self) -> Option<Subbuffer> {
        loop {
            let data = self.buffer().read_subbuffer()?;
            // A torn copy would have failed the claim; an invalid header here
            // means the sub-buffer was never written, so skip it.
            if let Some(subbuf) = Subbuffer::parse(data) {
                return Some(subbuf);
            }
        }
    }

    /// Read everything currently complete.
    pub fn drain(&self) -> Vec<Subbuffer> {
        core::iter::from_fn(|| self.try_read()).collect()
    }
}

impl Drop for ChannelReader {
    fn drop(&mut self) {
        self.buffer().reader_detached();
    }
}

impl Stream for ChannelReader {
    type Item = Subbuffer;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Subbuffer>> {
        if let Some(subbuf) = self.try_read() {
            return Poll::Ready(Some(subbuf));
        }
        self.buffer().register_waker(cx.waker());
        // Re-check after registering so a wakeup in between is not lost.
        if let Some(subbuf) = self.try_read() {
            return Poll::Ready(Some(subbuf));
        }
        if self.channel.is_finalized() {
            return Poll::Ready(None);
        }
        Poll::Pending
    }
}

impl core::fmt::Debug for ChannelReader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelReader")
            .field("trace", &self.channel.trace_name())
            .field("channel", &self.channel.kind())
            .field("cpu", &self.cpu)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;
    use crate::config::ChannelSizing;
    use crate::format::{TraceHeader, TraceStart};
    use crate::header::Field;
    use futures_util::StreamExt;

    fn channel(heartbeat: bool) -> Arc<Channel> {
        Channel::create(
            "t",
            ChannelKind::Processes,
            ChannelSizing::new(512, 4),
            false,
            HeaderFormat::new(heartbeat, true),
            TraceHeader::new(false, heartbeat, true, TraceStart::default()),
            1,
        )
        .unwrap()
    }

    #[test]
    fn test_events_round_trip() {
        let ch = channel(false);
        let reader = ChannelReader::new(ch.clone(), 0).unwrap();
        assert_eq!(ch.active_readers(), 1);

        for i in 0..5u32 {
            let name = b"init";
            ch.buffer_for(0)
                .write(3, i as u8, &[Field::scalar(&i), Field::bytes(name)])
                .unwrap();
        }
        assert!(reader.try_read().is_none());
        ch.flush();

        let subbuf = reader.try_read().unwrap();
        let events: Vec<_> = subbuf.events().collect();
        assert_eq!(events.len(), 5);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.facility_id, 3);
            assert_eq!(event.event_id, i as u8);
            assert_eq!(&event.payload[..4], &(i as u32).to_ne_bytes());
            assert_eq!(&event.payload[4..], b"init");
        }
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        drop(reader);
        assert_eq!(ch.active_readers(), 0);
    }

    #[test]
    fn test_compact_timestamps_are_extended() {
        let ch = channel(true);
        let reader = ChannelReader::new(ch.clone(), 0).unwrap();
        ch.buffer_for(0).write(1, 1, &[]).unwrap();
        ch.flush();

        let subbuf = reader.try_read().unwrap();
        let event = subbuf.events().next().unwrap();
        assert!(event.timestamp >= subbuf.header().begin_tsc);
        assert!(event.timestamp - subbuf.header().begin_tsc < 1 << 32);
    }

    #[test]
    fn test_reader_rejects_unknown_cpu() {
        assert_eq!(
            ChannelReader::new(channel(false), 3).unwrap_err(),
            TraceError::InvalidArgument
        );
    }

    #[test]
    fn test_stream_ends_after_finalize() {
        let ch = channel(false);
        let mut reader = ChannelReader::new(ch.clone(), 0).unwrap();
        let v = 9u64;
        ch.buffer_for(0).write(1, 2, &[Field::scalar(&v)]).unwrap();
        ch.flush();
        ch.finalize();

        let subbufs: Vec<Subbuffer> = collect_ready(&mut reader);
        assert_eq!(subbufs.len(), 1);
        assert_eq!(subbufs[0].events().count(), 1);
    }

    /// Poll the stream to completion with a no-op waker; it never pends once
    /// the channel is finalized.
    fn collect_ready(reader: &mut ChannelReader) -> Vec<Subbuffer> {
        let waker = futures_util::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut out = Vec::new();
        loop {
            match reader.poll_next_unpin(&mut cx) {
                Poll::Ready(Some(subbuf)) => out.push(subbuf),
                Poll::Ready(None) => return out,
                Poll::Pending => panic!("finalized stream must not pend"),
            }
        }
    }
}
