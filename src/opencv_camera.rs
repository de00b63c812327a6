use opencv::{
    core::{self, Mat, Vector},
    imgcodecs, imgproc,
    prelude::*,
    videoio,
};

use crate::camera::{Camera, CameraOpener, CameraProperty};
use crate::config::CameraConfig;
use crate::error::Error;
use crate::frame::GrayFrame;
use crate::scene::{MarkerMark, Overlay};

pub struct OpenCvCamera {
    cap: videoio::VideoCapture,
    frame: Mat,
    gray: Mat,
}

impl OpenCvCamera {
    pub fn open(config: &CameraConfig) -> Result<Self, Error> {
        let cap = videoio::VideoCapture::new(config.index, videoio::CAP_ANY)?;
        if !videoio::VideoCapture::is_opened(&cap)? {
            return Err(Error::CameraUnavailable(format!(
                "unable to open camera {}",
                config.index
            )));
        }

        Ok(Self {
            cap,
            frame: Mat::default(),
            gray: Mat::default(),
        })
    }

    pub fn opener() -> CameraOpener {
        Box::new(|config| Ok(Box::new(OpenCvCamera::open(config)?) as Box<dyn Camera>))
    }
}

fn property_id(property: CameraProperty) -> i32 {
    match property {
        CameraProperty::FrameWidth => videoio::CAP_PROP_FRAME_WIDTH,
        CameraProperty::FrameHeight => videoio::CAP_PROP_FRAME_HEIGHT,
        CameraProperty::Fps => videoio::CAP_PROP_FPS,
        CameraProperty::Autofocus => videoio::CAP_PROP_AUTOFOCUS,
        CameraProperty::Focus => videoio::CAP_PROP_FOCUS,
        CameraProperty::AutoExposure => videoio::CAP_PROP_AUTO_EXPOSURE,
        CameraProperty::Exposure => videoio::CAP_PROP_EXPOSURE,
        CameraProperty::Gain => videoio::CAP_PROP_GAIN,
        CameraProperty::Brightness => videoio::CAP_PROP_BRIGHTNESS,
        CameraProperty::Contrast => videoio::CAP_PROP_CONTRAST,
    }
}

impl Camera for OpenCvCamera {
    fn read(&mut self) -> Result<Option<GrayFrame>, Error> {
        if !self.cap.read(&mut self.frame)? {
            return Ok(None);
        }

        let (fwidth, fheight) = (self.frame.cols(), self.frame.rows());
        if fwidth == 0 || fheight == 0 {
            return Ok(None);
        }

        imgproc::cvt_color(&self.frame, &mut self.gray, imgproc::COLOR_BGR2GRAY, 0)?;

        let data = if self.gray.is_continuous() {
            self.gray.data_bytes()?.to_vec()
        } else {
            self.gray.try_clone()?.data_bytes()?.to_vec()
        };

        Ok(Some(GrayFrame::from_raw(fwidth as u32, fheight as u32, data)?))
    }

    fn set_property(&mut self, property: CameraProperty, value: f64) -> Result<(), Error> {
        if self.cap.set(property_id(property), value)? {
            Ok(())
        } else {
            Err(Error::PropertyRejected { property, value })
        }
    }

    fn encode(&mut self, overlay: &Overlay) -> Result<Vec<u8>, Error> {
        if self.frame.cols() == 0 || self.frame.rows() == 0 {
            return Err(Error::FrameAcquisition("no frame to encode".into()));
        }

        draw_overlay(&mut self.frame, overlay)?;

        let mut buf = Vector::<u8>::new();
        imgcodecs::imencode(".jpg", &self.frame, &mut buf, &Vector::new())?;

        Ok(buf.to_vec())
    }

    fn release(&mut self) {
        let _ = self.cap.release();
    }
}

fn draw_overlay(frame: &mut Mat, overlay: &Overlay) -> opencv::Result<()> {
    let (a, b) = overlay.finish_line.endpoints();

    imgproc::line(
        frame,
        core::Point::new(a.x as i32, a.y as i32),
        core::Point::new(b.x as i32, b.y as i32),
        core::Scalar::new(0.0, 255.0, 0.0, 0.0),
        2,
        imgproc::LINE_8,
        0,
    )?;

    for marker in &overlay.markers {
        let center = core::Point::new(marker.center.x as i32, marker.center.y as i32);

        let (color, radius) = match marker.mark {
            MarkerMark::Crossed => (core::Scalar::new(255.0, 255.0, 0.0, 0.0), 15),
            MarkerMark::Tracked => (core::Scalar::new(0.0, 0.0, 255.0, 0.0), 4),
            MarkerMark::Confirming => (core::Scalar::new(0.0, 255.0, 255.0, 0.0), 4),
            MarkerMark::Rejected | MarkerMark::Excluded => {
                (core::Scalar::new(128.0, 128.0, 128.0, 0.0), 4)
            }
        };

        imgproc::circle(frame, center, radius, color, imgproc::FILLED, imgproc::LINE_8, 0)?;

        if marker.mark == MarkerMark::Rejected {
            continue;
        }

        imgproc::put_text(
            frame,
            &format!("ID:{}", marker.id),
            core::Point::new(center.x + 6, center.y - 10),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            core::Scalar::new(0.0, 255.0, 0.0, 0.0),
            2,
            imgproc::LINE_AA,
            false,
        )?;
    }

    Ok(())
}
