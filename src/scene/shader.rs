// src/scene/shader.rs

/// Rotates the cuboid about y by the `theta` uniform.
pub const VERTEX_SHADER: &str = "#version 410
uniform mat4 zMVP;
uniform float theta;
layout(location = 0) in vec4 position;

mat4 rotateY(float a) {
  return mat4(
      cos(a), 0, sin(a), 0,
           0, 1,      0, 0,
     -sin(a), 0, cos(a), 0,
           0, 0,      0, 1
  );
}

void main()
{
  gl_Position = zMVP * rotateY(theta) * position;
}
";

pub const FRAGMENT_SHADER: &str = "#version 410
out vec4 outputColor;
void main()
{
  outputColor = vec4(1.0, 0.0, 0.0, 1.0);
}
";

/// Source bytes as uploaded: the text plus a trailing NUL, which the
/// compositor's GL loader expects.
pub fn source_bytes(source: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(source.len() + 1);
    bytes.extend_from_slice(source.as_bytes());
    bytes.push(0);
    bytes
}
