//! DASH `manifest.mpd` authoring.
//!
//! ffmpeg's own `dash` muxer can write a manifest directly, but this adapter
//! segments with the plain `segment` muxer and builds the manifest itself
//! afterward, the way the teacher authors other XML formats (Torznab RSS)
//! rather than hand-building strings.

use std::io::Cursor;

use anyhow::Result;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};

pub struct DashManifestSpec<'a> {
    pub duration_secs: f64,
    pub segment_duration_secs: f64,
    pub init_segment: &'a str,
    pub segment_files: &'a [String],
    pub width: u32,
    pub height: u32,
    pub video_codec_tag: &'a str,
    pub video_bitrate_bps: i64,
    pub audio_codec_tag: Option<&'a str>,
    pub audio_bitrate_bps: Option<i64>,
}

pub fn render_dash_manifest(spec: &DashManifestSpec<'_>) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut mpd = BytesStart::new("MPD");
    mpd.push_attribute(("xmlns", "urn:mpeg:dash:schema:mpd:2011"));
    mpd.push_attribute(("profiles", "urn:mpeg:dash:profile:isoff-on-demand:2011"));
    mpd.push_attribute(("type", "static"));
    let duration_attr = format!("PT{:.3}S", spec.duration_secs);
    mpd.push_attribute(("mediaPresentationDuration", duration_attr.as_str()));
    mpd.push_attribute(("minBufferTime", "PT2S"));
    writer.write_event(Event::Start(mpd))?;

    writer.write_event(Event::Start(BytesStart::new("Period")))?;

    write_adaptation_set(
        &mut writer,
        "video",
        "video/mp4",
        spec.video_codec_tag,
        spec.video_bitrate_bps,
        Some((spec.width, spec.height)),
        spec,
    )?;

    if let (Some(codec), Some(bitrate)) = (spec.audio_codec_tag, spec.audio_bitrate_bps) {
        write_adaptation_set(&mut writer, "audio", "audio/mp4", codec, bitrate, None, spec)?;
    }

    writer.write_event(Event::End(BytesEnd::new("Period")))?;
    writer.write_event(Event::End(BytesEnd::new("MPD")))?;

    Ok(writer.into_inner().into_inner())
}

fn write_adaptation_set(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    content_type: &str,
    mime_type: &str,
    codec_tag: &str,
    bitrate_bps: i64,
    dims: Option<(u32, u32)>,
    spec: &DashManifestSpec<'_>,
) -> Result<()> {
    let mut adaptation_set = BytesStart::new("AdaptationSet");
    adaptation_set.push_attribute(("contentType", content_type));
    adaptation_set.push_attribute(("mimeType", mime_type));
    adaptation_set.push_attribute(("segmentAlignment", "true"));
    writer.write_event(Event::Start(adaptation_set))?;

    let mut representation = BytesStart::new("Representation");
    representation.push_attribute(("id", format!("{content_type}-0").as_str()));
    representation.push_attribute(("codecs", codec_tag));
    representation.push_attribute(("bandwidth", bitrate_bps.to_string().as_str()));
    if let Some((w, h)) = dims {
        representation.push_attribute(("width", w.to_string().as_str()));
        representation.push_attribute(("height", h.to_string().as_str()));
    }
    writer.write_event(Event::Start(representation))?;

    let mut segment_list = BytesStart::new("SegmentList");
    let segment_duration_ms = (spec.segment_duration_secs * 1000.0).round() as i64;
    segment_list.push_attribute(("duration", segment_duration_ms.to_string().as_str()));
    segment_list.push_attribute(("timescale", "1000"));
    writer.write_event(Event::Start(segment_list))?;

    let mut init = BytesStart::new("Initialization");
    init.push_attribute(("sourceURL", spec.init_segment));
    writer.write_event(Event::Empty(init))?;

    for file in spec.segment_files {
        let mut segment_url = BytesStart::new("SegmentURL");
        segment_url.push_attribute(("media", file.as_str()));
        writer.write_event(Event::Empty(segment_url))?;
    }

    writer.write_event(Event::End(BytesEnd::new("SegmentList")))?;
    writer.write_event(Event::End(BytesEnd::new("Representation")))?;
    writer.write_event(Event::End(BytesEnd::new("AdaptationSet")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_valid_looking_manifest() {
        let segment_files = vec!["segment_0.m4s".to_string(), "segment_1.m4s".to_string()];
        let spec = DashManifestSpec {
            duration_secs: 8.0,
            segment_duration_secs: 4.0,
            init_segment: "init.mp4",
            segment_files: &segment_files,
            width: 1920,
            height: 1080,
            video_codec_tag: "avc1.640028",
            video_bitrate_bps: 3_000_000,
            audio_codec_tag: Some("mp4a.40.2"),
            audio_bitrate_bps: Some(128_000),
        };
        let xml = String::from_utf8(render_dash_manifest(&spec).unwrap()).unwrap();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<MPD"));
        assert!(xml.contains("segment_0.m4s"));
        assert!(xml.contains("segment_1.m4s"));
        assert!(xml.contains("audio/mp4"));
    }
}
